// SPDX-License-Identifier: CEPL-1.0
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    #[cfg(feature = "triangle")]
    triangle::compile();
}

#[cfg(feature = "triangle")]
mod triangle {
    use std::{env, fs, path::PathBuf};

    // Matches the pipeline vertex layout:
    //   binding 0, location 0: R32G32_SFLOAT (pos)
    //   binding 0, location 1: R32G32B32_SFLOAT (color)
    const VS_SRC: &str = r#"
#version 450
layout(location = 0) in vec2 inPos;
layout(location = 1) in vec3 inColor;

layout(location = 0) out vec3 vColor;

void main() {
    vColor = inColor;
    gl_Position = vec4(inPos, 0.0, 1.0);
}
"#;

    const FS_SRC: &str = r#"
#version 450
layout(location = 0) in vec3 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0);
}
"#;

    pub fn compile() {
        let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));

        let comp = shaderc::Compiler::new().expect("shaderc compiler");
        let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
        opts.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_0 as u32,
        );
        opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

        for (src, kind, name) in [
            (VS_SRC, shaderc::ShaderKind::Vertex, "tri.vert"),
            (FS_SRC, shaderc::ShaderKind::Fragment, "tri.frag"),
        ] {
            let spv = comp
                .compile_into_spirv(src, kind, name, "main", Some(&opts))
                .unwrap_or_else(|e| panic!("{name}: {e}"));
            fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())
                .unwrap_or_else(|e| panic!("{name}.spv: {e}"));
        }
    }
}
