#![allow(dead_code)]

use std::sync::Once;

use opal::*;

static INIT_LOGGING: Once = Once::new();

/// Vulkan may be missing entirely on CI machines; tests bail out instead of
/// failing when no driver can be loaded.
pub fn headless_device(test: &str) -> Option<Device> {
    INIT_LOGGING.call_once(env_logger::init);
    match Device::headless() {
        Ok(device) => Some(device),
        Err(err) => {
            eprintln!("skipping {}: Vulkan initialization unavailable: {:?}", test, err);
            None
        }
    }
}

/// Hand-assembled empty `main()` module, enough for module creation and
/// pipeline construction. Binding metadata travels separately through
/// `ShaderInfo::descriptors`, so the SPIR-V body stays trivial.
pub fn minimal_spirv(stage: ShaderStage) -> Vec<u32> {
    let execution_model: u32 = if stage.contains(ShaderStage::COMPUTE) {
        5 // GLCompute
    } else if stage.contains(ShaderStage::FRAGMENT) {
        4 // Fragment
    } else {
        0 // Vertex
    };

    let mut words = vec![
        0x0723_0203, // magic
        0x0001_0000, // SPIR-V 1.0
        0,           // generator
        6,           // id bound
        0,           // schema
        0x0002_0011, 1,    // OpCapability Shader
        0x0003_000E, 0, 1, // OpMemoryModel Logical GLSL450
    ];
    // OpEntryPoint <model> %4 "main"
    words.extend([0x0005_000F, execution_model, 4, 0x6E69_616D, 0]);
    if stage.contains(ShaderStage::FRAGMENT) {
        // OpExecutionMode %4 OriginUpperLeft
        words.extend([0x0003_0010, 4, 7]);
    }
    if stage.contains(ShaderStage::COMPUTE) {
        // OpExecutionMode %4 LocalSize 1 1 1
        words.extend([0x0006_0010, 4, 17, 1, 1, 1]);
    }
    words.extend([
        0x0002_0013, 1,          // %1 = OpTypeVoid
        0x0003_0021, 2, 1,       // %2 = OpTypeFunction %1
        0x0005_0036, 1, 4, 0, 2, // %4 = OpFunction %1 None %2
        0x0002_00F8, 5,          // %5 = OpLabel
        0x0001_00FD,             // OpReturn
        0x0001_0038,             // OpFunctionEnd
    ]);
    words
}

pub fn make_vertex_shader(
    device: &mut Device,
    name: &str,
    descriptors: &[Descriptor],
) -> Handle<Shader> {
    let spirv = minimal_spirv(ShaderStage::VERTEX);
    device
        .make_shader(&ShaderInfo {
            debug_name: name,
            stage: ShaderStage::VERTEX,
            spirv: &spirv,
            descriptors,
            ..Default::default()
        })
        .unwrap()
}

pub fn make_compute_shader(
    device: &mut Device,
    name: &str,
    descriptors: &[Descriptor],
) -> Handle<Shader> {
    let spirv = minimal_spirv(ShaderStage::COMPUTE);
    device
        .make_shader(&ShaderInfo {
            debug_name: name,
            stage: ShaderStage::COMPUTE,
            spirv: &spirv,
            descriptors,
            ..Default::default()
        })
        .unwrap()
}

pub fn make_fragment_shader(
    device: &mut Device,
    name: &str,
    descriptors: &[Descriptor],
) -> Handle<Shader> {
    let spirv = minimal_spirv(ShaderStage::FRAGMENT);
    device
        .make_shader(&ShaderInfo {
            debug_name: name,
            stage: ShaderStage::FRAGMENT,
            spirv: &spirv,
            descriptors,
            ..Default::default()
        })
        .unwrap()
}
