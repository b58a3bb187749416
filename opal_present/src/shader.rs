/*! Compiles the built-in blit shaders from GLSL source through the
 * `glslangValidator` CLI.
 */

use std::{fs, path::PathBuf, process::Command};

use anyhow::{Context, Result};
use ash::vk;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn to_glslang_compiler_extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
        }
    }

    pub(crate) fn to_vulkan_shader_stage_flag(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

fn temp_path(file_name: &str) -> PathBuf {
    std::env::temp_dir().join(file_name)
}

/// Writes `source` to a temp file, invokes glslangValidator on it and
/// returns the SPIR-V words.
pub(crate) fn compile_shader_source(source: &str, shader_stage: ShaderStage) -> Result<Vec<u32>> {
    let extension = shader_stage.to_glslang_compiler_extension();
    let source_path = temp_path(&format!("opal_present_blit.{extension}"));
    let binary_path = temp_path(&format!("opal_present_blit.{extension}.spv"));

    fs::write(&source_path, source)
        .with_context(|| format!("Failed to write shader source to {source_path:?}"))?;

    let command_name = match std::env::consts::OS {
        "windows" => "glslangvalidator.exe",
        _ => "glslangValidator",
    };

    let command_output = Command::new(command_name)
        .arg(&source_path)
        .arg("-V")
        .args(["--target-env", "vulkan1.3"])
        .arg("-o")
        .arg(&binary_path)
        .args(["-S", extension])
        .output()
        .context("Failed to run glslangValidator")?;

    let _ = fs::remove_file(&source_path);

    if !command_output.status.success() {
        log::error!(
            "glslangValidator returned error: {:?}",
            String::from_utf8_lossy(&command_output.stdout)
        );
        anyhow::bail!("Failed to compile shader through glslangValidator");
    }

    let bytes = fs::read(&binary_path)
        .with_context(|| format!("Failed to read shader binary {binary_path:?}"))?;
    let _ = fs::remove_file(&binary_path);

    let mut cursor = std::io::Cursor::new(bytes);
    let code = ash::util::read_spv(&mut cursor)?;
    Ok(code)
}
