//! Presentation program.
//!
//! The sources are GLSL 450 and are translated to WGSL with naga before wgpu
//! sees them, so a broken program is caught at setup.

mod gpu_context;

pub use gpu_context::GpuContext;

use crate::error::{PipelineError, Result};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::ShaderStage;

/// Binding of the camera texture.
pub const TEXTURE_BINDING: u32 = 0;
/// Binding of the camera sampler.
pub const SAMPLER_BINDING: u32 = 1;
/// Binding of the texture-coordinate transform uniform.
pub const TRANSFORM_BINDING: u32 = 2;

/// Entry point name naga gives both translated stages.
pub const ENTRY_POINT: &str = "main";

/// Full-screen quad. The texture coordinate is first mapped into the visible
/// window of the image, then rotated about the texture center.
pub const VERTEX_SHADER: &str = r#"#version 450

layout(location = 0) in vec2 a_position;
layout(location = 1) in vec2 a_tex_coord;

layout(location = 0) out vec2 v_tex_coord;

layout(set = 0, binding = 2) uniform Transform {
    mat4 tex_rotate;
    vec2 uv_offset;
    vec2 uv_scale;
} u_transform;

void main() {
    vec2 window = u_transform.uv_offset + a_tex_coord * u_transform.uv_scale;
    vec4 rotated = u_transform.tex_rotate * vec4(window - vec2(0.5), 0.0, 1.0);
    v_tex_coord = rotated.xy + vec2(0.5);
    gl_Position = vec4(a_position, 0.0, 1.0);
}
"#;

pub const FRAGMENT_SHADER: &str = r#"#version 450

layout(location = 0) in vec2 v_tex_coord;
layout(location = 0) out vec4 o_color;

layout(set = 0, binding = 0) uniform texture2D t_camera;
layout(set = 0, binding = 1) uniform sampler s_camera;

void main() {
    o_color = texture(sampler2D(t_camera, s_camera), v_tex_coord);
}
"#;

/// WGSL for both stages of a validated program.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub vertex_wgsl: String,
    pub fragment_wgsl: String,
}

/// Compiles the built-in presentation program.
pub fn compile_presentation_program() -> Result<CompiledProgram> {
    compile_program(VERTEX_SHADER, FRAGMENT_SHADER)
}

/// Translates and validates a vertex/fragment pair.
pub fn compile_program(vertex_glsl: &str, fragment_glsl: &str) -> Result<CompiledProgram> {
    let vertex_wgsl = glsl_to_wgsl(vertex_glsl, ShaderStage::Vertex)?;
    let fragment_wgsl = glsl_to_wgsl(fragment_glsl, ShaderStage::Fragment)?;
    Ok(CompiledProgram {
        vertex_wgsl,
        fragment_wgsl,
    })
}

fn parse(glsl: &str, stage: ShaderStage) -> Result<naga::Module> {
    let mut frontend = Frontend::default();
    frontend
        .parse(&Options::from(stage), glsl)
        .map_err(|e| PipelineError::ShaderCompileFailed(format!("{stage:?} GLSL parse error: {e:?}")))
}

fn glsl_to_wgsl(glsl: &str, stage: ShaderStage) -> Result<String> {
    let module = parse(glsl, stage)?;
    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| PipelineError::ShaderCompileFailed(format!("{stage:?} validation error: {e:?}")))?;
    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| PipelineError::ShaderCompileFailed(format!("{stage:?} WGSL generation error: {e:?}")))
}

/// Resource bindings (group, binding) declared by a GLSL stage.
pub fn declared_bindings(glsl: &str, stage: ShaderStage) -> Result<Vec<(u32, u32)>> {
    let module = parse(glsl, stage)?;
    let mut bindings: Vec<(u32, u32)> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| var.binding.as_ref().map(|b| (b.group, b.binding)))
        .collect();
    bindings.sort_unstable();
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_program_compiles() {
        let program = compile_presentation_program().unwrap();
        assert!(program.vertex_wgsl.contains("@vertex"));
        assert!(program.fragment_wgsl.contains("@fragment"));
    }

    #[test]
    fn bindings_match_bind_group_layout() {
        let vertex = declared_bindings(VERTEX_SHADER, ShaderStage::Vertex).unwrap();
        let fragment = declared_bindings(FRAGMENT_SHADER, ShaderStage::Fragment).unwrap();
        assert_eq!(vertex, vec![(0, TRANSFORM_BINDING)]);
        assert_eq!(fragment, vec![(0, TEXTURE_BINDING), (0, SAMPLER_BINDING)]);
    }

    #[test]
    fn broken_source_is_a_compile_failure() {
        let err = compile_program(VERTEX_SHADER, "#version 450\nvoid main() { undefined_call(); }\n").unwrap_err();
        assert!(matches!(err, PipelineError::ShaderCompileFailed(_)));
    }
}
