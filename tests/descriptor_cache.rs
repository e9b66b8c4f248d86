mod common;

use common::*;
use opal::*;
use serial_test::serial;

fn cbuffer_shape(slot: u32) -> Descriptor {
    Descriptor::shape(DescriptorKind::ConstantBuffer, slot, ShaderStage::VERTEX)
}

fn texture_shape(slot: u32) -> Descriptor {
    Descriptor::shape(DescriptorKind::Texture, slot, ShaderStage::FRAGMENT)
}

fn graphics_state(vs: Handle<Shader>, ps: Handle<Shader>) -> PipelineState {
    PipelineState {
        pass_name: "test".into(),
        vertex_shader: Some(vs),
        pixel_shader: Some(ps),
        ..Default::default()
    }
}

#[test]
#[serial]
fn identical_shapes_share_one_layout() {
    let Some(mut device) = headless_device("identical_shapes_share_one_layout") else {
        return;
    };
    let mut cache = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();

    let shapes = [cbuffer_shape(0)];
    let vs_a = make_vertex_shader(&mut device, "a.vert", &shapes);
    let ps_a = make_fragment_shader(&mut device, "a.frag", &[texture_shape(0)]);
    let vs_b = make_vertex_shader(&mut device, "b.vert", &shapes);
    let ps_b = make_fragment_shader(&mut device, "b.frag", &[texture_shape(0)]);

    cache.set_pipeline_state(&graphics_state(vs_a, ps_a)).unwrap();
    let first = cache.current_layout().unwrap() as *const _;

    cache.set_pipeline_state(&graphics_state(vs_b, ps_b)).unwrap();
    let second = cache.current_layout().unwrap() as *const _;
    assert_eq!(first, second, "same binding shape must reuse the layout");

    // A different shape lands on a different layout.
    let vs_c = make_vertex_shader(&mut device, "c.vert", &[cbuffer_shape(1)]);
    let ps_c = make_fragment_shader(&mut device, "c.frag", &[]);
    cache.set_pipeline_state(&graphics_state(vs_c, ps_c)).unwrap();
    let third = cache.current_layout().unwrap() as *const _;
    assert_ne!(first, third);

    cache.destroy();
    device.destroy();
}

#[test]
#[serial]
fn one_set_per_binding_combination() {
    let Some(mut device) = headless_device("one_set_per_binding_combination") else {
        return;
    };
    let mut cache = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();

    let vs = make_vertex_shader(&mut device, "set.vert", &[cbuffer_shape(0)]);
    let ps = make_fragment_shader(&mut device, "set.frag", &[]);
    let state = graphics_state(vs, ps);

    let buffer = device
        .make_buffer(&BufferInfo {
            debug_name: "uniforms",
            byte_size: 1024,
            visibility: MemoryVisibility::CpuAndGpu,
            ..Default::default()
        })
        .unwrap();
    let buffer_id = device.buffer(buffer).unwrap().gpu_id();

    cache.set_pipeline_state(&state).unwrap();
    cache.set_constant_buffer(0, buffer_id, 0, 256, 0);

    // First resolution allocates; identical bindings afterwards resolve to
    // nothing at all.
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    assert!(cache.retrieve_descriptor_set().unwrap().is_none());
    assert_eq!(cache.descriptor_set_count().unwrap(), 1);

    // A pipeline change forces a rebind of the same set, not a new one.
    cache.set_pipeline_state(&state).unwrap();
    cache.set_constant_buffer(0, buffer_id, 0, 256, 0);
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    assert_eq!(cache.descriptor_set_count().unwrap(), 1);

    // A different offset is a different combination.
    cache.set_constant_buffer(0, buffer_id, 256, 256, 0);
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    assert_eq!(cache.descriptor_set_count().unwrap(), 2);

    cache.destroy();
    device.destroy();
}

#[test]
#[serial]
fn exhausted_pool_grows_and_recovers() {
    let Some(mut device) = headless_device("exhausted_pool_grows_and_recovers") else {
        return;
    };
    let mut cache = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();

    let vs = make_vertex_shader(&mut device, "grow.vert", &[cbuffer_shape(0)]);
    let ps = make_fragment_shader(&mut device, "grow.frag", &[]);
    let state = graphics_state(vs, ps);

    let buffer = device
        .make_buffer(&BufferInfo {
            debug_name: "big uniforms",
            byte_size: 32 * 256,
            visibility: MemoryVisibility::CpuAndGpu,
            ..Default::default()
        })
        .unwrap();
    let buffer_id = device.buffer(buffer).unwrap().gpu_id();

    cache.set_pipeline_state(&state).unwrap();
    for i in 0..16u32 {
        cache.set_constant_buffer(0, buffer_id, i * 256, 256, 0);
        assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    }
    assert_eq!(cache.descriptor_set_count().unwrap(), 16);

    // The 17th combination does not fit; the error is recoverable.
    cache.set_constant_buffer(0, buffer_id, 16 * 256, 256, 0);
    match cache.retrieve_descriptor_set() {
        Err(GPUError::DescriptorPoolExhausted { capacity }) => assert_eq!(capacity, 16),
        other => panic!("expected pool exhaustion, got {:?}", other.map(|r| r.is_some())),
    }

    // Growth doubles the pool and invalidates everything cached.
    cache.grow_if_needed().unwrap();
    assert_eq!(cache.capacity(), 32);
    assert_eq!(cache.descriptor_set_count().unwrap(), 0);

    cache.set_pipeline_state(&state).unwrap();
    cache.set_constant_buffer(0, buffer_id, 16 * 256, 256, 0);
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    assert_eq!(cache.descriptor_set_count().unwrap(), 1);

    cache.destroy();
    device.destroy();
}

#[test]
#[serial]
fn resizing_to_current_capacity_is_a_noop() {
    let Some(mut device) = headless_device("resizing_to_current_capacity_is_a_noop") else {
        return;
    };
    let mut cache = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();

    let vs = make_vertex_shader(&mut device, "noop.vert", &[cbuffer_shape(0)]);
    let ps = make_fragment_shader(&mut device, "noop.frag", &[]);
    cache.set_pipeline_state(&graphics_state(vs, ps)).unwrap();
    let before = cache.current_layout().unwrap() as *const _;

    cache.set_capacity(16).unwrap();
    assert_eq!(cache.capacity(), 16);
    let after = cache.current_layout().expect("layout survived the no-op") as *const _;
    assert_eq!(before, after);

    cache.destroy();
    device.destroy();
}

#[test]
#[serial]
fn resource_destruction_clears_cached_sets() {
    let Some(mut device) = headless_device("resource_destruction_clears_cached_sets") else {
        return;
    };
    let mut cache = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();

    let vs = make_vertex_shader(&mut device, "clear.vert", &[cbuffer_shape(0)]);
    let ps = make_fragment_shader(&mut device, "clear.frag", &[]);
    let state = graphics_state(vs, ps);

    let buffer = device
        .make_buffer(&BufferInfo {
            debug_name: "uniforms",
            byte_size: 1024,
            visibility: MemoryVisibility::CpuAndGpu,
            ..Default::default()
        })
        .unwrap();
    let doomed = device
        .make_buffer(&BufferInfo {
            debug_name: "doomed",
            byte_size: 256,
            visibility: MemoryVisibility::CpuAndGpu,
            ..Default::default()
        })
        .unwrap();
    let buffer_id = device.buffer(buffer).unwrap().gpu_id();

    cache.set_pipeline_state(&state).unwrap();
    cache.set_constant_buffer(0, buffer_id, 0, 256, 0);
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    assert_eq!(cache.descriptor_set_count().unwrap(), 1);

    // Destruction only raises the signal; the clear happens at the cache's
    // next safe point.
    device.destroy_buffer(doomed);
    assert_eq!(cache.descriptor_set_count().unwrap(), 1);

    cache.clear_if_pending().unwrap();
    assert_eq!(cache.descriptor_set_count().unwrap(), 0);

    // The surviving binding resolves to a freshly written set.
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());
    assert_eq!(cache.descriptor_set_count().unwrap(), 1);

    cache.destroy();
    device.destroy();
}

#[test]
#[serial]
fn global_bindings_follow_pipeline_changes() {
    let Some(mut device) = headless_device("global_bindings_follow_pipeline_changes") else {
        return;
    };
    let mut cache = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();

    let sampler = device.make_sampler(&SamplerInfo::default()).unwrap();
    let sampler_id = device.sampler(sampler).unwrap().gpu_id();

    let sampler_shape = Descriptor::shape(DescriptorKind::Sampler, 0, ShaderStage::FRAGMENT);
    let vs_a = make_vertex_shader(&mut device, "ga.vert", &[cbuffer_shape(0)]);
    let ps_a = make_fragment_shader(&mut device, "ga.frag", &[sampler_shape]);
    let vs_b = make_vertex_shader(&mut device, "gb.vert", &[]);
    let ps_b = make_fragment_shader(&mut device, "gb.frag", &[sampler_shape]);

    cache.set_pipeline_state(&graphics_state(vs_a, ps_a)).unwrap();
    cache.set_global_sampler(0, sampler_id);
    assert!(cache.retrieve_descriptor_set().unwrap().is_some());

    // The second layout has never seen the sampler bind call, but the global
    // re-applies on the state change.
    cache.set_pipeline_state(&graphics_state(vs_b, ps_b)).unwrap();
    let resolved = cache.retrieve_descriptor_set().unwrap();
    assert!(resolved.is_some());

    cache.destroy();
    device.destroy();
}
