mod common;

use common::*;
use opal::*;
use serial_test::serial;

#[test]
#[serial]
fn empty_cycle_walks_all_states() {
    let Some(mut device) = headless_device("empty_cycle_walks_all_states") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let mut cmd = CommandList::new(&mut device, &mut descriptors, &mut pipelines, "cycle").unwrap();
    assert_eq!(cmd.state(), CommandListState::Idle);

    cmd.begin().unwrap();
    assert_eq!(cmd.state(), CommandListState::Recording);

    cmd.end().unwrap();
    assert_eq!(cmd.state(), CommandListState::Ended);

    cmd.submit().unwrap();
    assert_eq!(cmd.state(), CommandListState::Submitted);
    // The handoff semaphore is available for chaining dependent submits.
    assert!(cmd.processed_semaphore().valid());

    cmd.wait().unwrap();
    assert_eq!(cmd.state(), CommandListState::Idle);

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

#[test]
#[serial]
fn wrong_state_operations_are_rejected() {
    let Some(mut device) = headless_device("wrong_state_operations_are_rejected") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "rejects").unwrap();

    assert!(matches!(
        cmd.end(),
        Err(GPUError::InvalidCommandListState { op: "end", .. })
    ));
    assert!(matches!(
        cmd.submit(),
        Err(GPUError::InvalidCommandListState { op: "submit", .. })
    ));
    assert!(matches!(
        cmd.draw(3, 1, 0, 0),
        Err(GPUError::InvalidCommandListState { op: "draw", .. })
    ));

    cmd.begin().unwrap();
    assert!(matches!(
        cmd.begin(),
        Err(GPUError::InvalidCommandListState { op: "begin", .. })
    ));
    assert!(matches!(
        cmd.wait(),
        Err(GPUError::InvalidCommandListState { op: "wait", .. })
    ));

    // The failed calls must not have corrupted the cycle.
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

#[test]
#[serial]
fn begin_after_submit_waits_implicitly() {
    let Some(mut device) = headless_device("begin_after_submit_waits_implicitly") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "rearm").unwrap();

    cmd.begin().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    assert_eq!(cmd.state(), CommandListState::Submitted);

    // No explicit wait: begin performs it.
    cmd.begin().unwrap();
    assert_eq!(cmd.state(), CommandListState::Recording);
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

#[test]
#[serial]
fn flush_is_transparent_from_every_state() {
    let Some(mut device) = headless_device("flush_is_transparent_from_every_state") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "flush").unwrap();

    // Idle: nothing to do.
    cmd.flush().unwrap();
    assert_eq!(cmd.state(), CommandListState::Idle);

    // Recording without a render pass: drains and restores recording.
    cmd.begin().unwrap();
    cmd.flush().unwrap();
    assert_eq!(cmd.state(), CommandListState::Recording);

    // Ended: drains to idle.
    cmd.end().unwrap();
    cmd.flush().unwrap();
    assert_eq!(cmd.state(), CommandListState::Idle);

    // Submitted: equivalent to wait.
    cmd.begin().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.flush().unwrap();
    assert_eq!(cmd.state(), CommandListState::Idle);

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

fn offscreen_state(vs: Handle<Shader>, ps: Handle<Shader>, target: Handle<Texture>, size: u32) -> PipelineState {
    let mut state = PipelineState {
        pass_name: "offscreen".into(),
        vertex_shader: Some(vs),
        pixel_shader: Some(ps),
        viewport: Viewport {
            x: 0.0,
            y: 0.0,
            w: size as f32,
            h: size as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        },
        scissor: Rect2D {
            x: 0,
            y: 0,
            w: size,
            h: size,
        },
        ..Default::default()
    };
    state.render_targets[0] = Some(target);
    state.clear_values[0] = Some(ClearValue::Color([0.0, 0.0, 0.0, 1.0]));
    state
}

#[test]
#[serial]
fn offscreen_draw_round_trip() {
    let Some(mut device) = headless_device("offscreen_draw_round_trip") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let vs = make_vertex_shader(&mut device, "tri.vert", &[]);
    let ps = make_fragment_shader(&mut device, "tri.frag", &[]);
    let target = device
        .make_texture(&TextureInfo {
            debug_name: "offscreen target",
            dim: [64, 64],
            format: Format::RGBA8Unorm,
            mip_levels: 1,
            layers: 1,
            render_target: true,
        })
        .unwrap();
    let state = offscreen_state(vs, ps, target, 64);

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "offscreen").unwrap();
    cmd.begin().unwrap();
    cmd.begin_render_pass(&state).unwrap();
    cmd.draw(3, 1, 0, 0).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();

    // The same state on the next frame hits the cached pipeline.
    assert_eq!(pipelines.len(), 1);
    cmd.begin().unwrap();
    cmd.begin_render_pass(&state).unwrap();
    cmd.draw(3, 1, 0, 0).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();
    assert_eq!(pipelines.len(), 1);

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

#[test]
#[serial]
fn compute_dispatch_round_trip() {
    let Some(mut device) = headless_device("compute_dispatch_round_trip") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let cs = make_compute_shader(&mut device, "noop.comp", &[]);
    let state = PipelineState {
        pass_name: "compute".into(),
        compute_shader: Some(cs),
        ..Default::default()
    };

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "compute").unwrap();
    cmd.begin().unwrap();
    cmd.begin_render_pass(&state).unwrap();
    cmd.dispatch(1, 1, 1).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();
    assert_eq!(pipelines.len(), 1);

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

#[test]
#[serial]
fn indexed_draw_binds_buffers_once() {
    let Some(mut device) = headless_device("indexed_draw_binds_buffers_once") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let vs = make_vertex_shader(&mut device, "indexed.vert", &[]);
    let ps = make_fragment_shader(&mut device, "indexed.frag", &[]);
    let target = device
        .make_texture(&TextureInfo {
            debug_name: "indexed target",
            dim: [32, 32],
            format: Format::RGBA8Unorm,
            mip_levels: 1,
            layers: 1,
            render_target: true,
        })
        .unwrap();
    let state = offscreen_state(vs, ps, target, 32);

    let vertices: Vec<u8> = vec![0; 3 * 16];
    let indices: Vec<u8> = [0u32, 1, 2].iter().flat_map(|i| i.to_ne_bytes()).collect();
    let vbo = device
        .make_buffer(&BufferInfo {
            debug_name: "tri verts",
            byte_size: vertices.len() as u32,
            usage: BufferUsage::Vertex,
            initial_data: Some(&vertices),
            ..Default::default()
        })
        .unwrap();
    let ibo = device
        .make_buffer(&BufferInfo {
            debug_name: "tri indices",
            byte_size: indices.len() as u32,
            usage: BufferUsage::Index,
            initial_data: Some(&indices),
            ..Default::default()
        })
        .unwrap();

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "indexed").unwrap();
    cmd.begin().unwrap();
    cmd.begin_render_pass(&state).unwrap();
    cmd.set_vertex_buffer(vbo).unwrap();
    cmd.set_index_buffer(ibo).unwrap();
    // Rebinding the same buffers is absorbed by the gpu-id check.
    cmd.set_vertex_buffer(vbo).unwrap();
    cmd.set_index_buffer(ibo).unwrap();
    cmd.draw_indexed(3, 1, 0, 0, 0).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();

    cmd.destroy(&mut device);
    device.destroy_buffer(vbo);
    device.destroy_buffer(ibo);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}

#[test]
#[serial]
fn flush_inside_a_render_pass_keeps_recording() {
    let Some(mut device) = headless_device("flush_inside_a_render_pass_keeps_recording") else {
        return;
    };
    let mut descriptors = DescriptorSetLayoutCache::new(&mut device, 16).unwrap();
    let mut pipelines = PipelineCache::new(&mut device);

    let vs = make_vertex_shader(&mut device, "mid.vert", &[]);
    let ps = make_fragment_shader(&mut device, "mid.frag", &[]);
    let target = device
        .make_texture(&TextureInfo {
            debug_name: "mid target",
            dim: [32, 32],
            format: Format::RGBA8Unorm,
            mip_levels: 1,
            layers: 1,
            render_target: true,
        })
        .unwrap();
    let state = offscreen_state(vs, ps, target, 32);

    let mut cmd =
        CommandList::new(&mut device, &mut descriptors, &mut pipelines, "mid flush").unwrap();
    cmd.begin().unwrap();
    cmd.begin_render_pass(&state).unwrap();
    cmd.draw(3, 1, 0, 0).unwrap();

    cmd.flush().unwrap();
    assert_eq!(cmd.state(), CommandListState::Recording);

    // Recording continues transparently after the flush.
    cmd.draw(3, 1, 0, 0).unwrap();
    cmd.end_render_pass().unwrap();
    cmd.end().unwrap();
    cmd.submit().unwrap();
    cmd.wait().unwrap();

    cmd.destroy(&mut device);
    pipelines.destroy();
    descriptors.destroy();
    device.destroy();
}
