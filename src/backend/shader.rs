// Shader compilation and module creation
//
// Shaders ship as GLSL source and go through shaderc at startup. A failed
// compile carries the compiler log and aborts pipeline construction.

use anyhow::{anyhow, Context, Result};
use ash::vk;
use super::VulkanDevice;

fn shader_kind(stage: vk::ShaderStageFlags) -> shaderc::ShaderKind {
    match stage {
        vk::ShaderStageFlags::VERTEX => shaderc::ShaderKind::Vertex,
        vk::ShaderStageFlags::FRAGMENT => shaderc::ShaderKind::Fragment,
        vk::ShaderStageFlags::COMPUTE => shaderc::ShaderKind::Compute,
        _ => shaderc::ShaderKind::InferFromSource,
    }
}

/// Compile GLSL source to SPIR-V words for the given stage.
pub fn compile_glsl(
    compiler: &shaderc::Compiler,
    source: &str,
    file_name: &str,
    stage: vk::ShaderStageFlags,
    entry_point: &str,
) -> Result<Vec<u32>> {
    let mut options = shaderc::CompileOptions::new()
        .context("failed to initialize shader compile options")?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);

    let artifact = compiler
        .compile_into_spirv(source, shader_kind(stage), file_name, entry_point, Some(&options))
        .map_err(|e| {
            log::error!("Shader compilation failed for {}:\n{}", file_name, e);
            anyhow!("failed to compile shader {}", file_name)
        })?;

    if artifact.get_num_warnings() > 0 {
        log::warn!("{}: {}", file_name, artifact.get_warning_messages());
    }

    Ok(artifact.as_binary().to_vec())
}

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("failed to create shader module")
    }
}
