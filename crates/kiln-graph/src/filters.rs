//! Pre-built image filters.
//!
//! Each filter is a fixed compute program reading a sampled source texture
//! and writing a storage destination. Backends compile the WGSL returned by
//! [`ImageFilter::source`] once per filter pass.

use kiln_core::PixelFormat;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageFilter {
    GaussianBlur { sigma: f32 },
    /// Sobel gradient magnitude of the luminance.
    Sobel,
    /// 1 where luminance is at least `level`, 0 elsewhere.
    Threshold { level: f32 },
}

/// Workgroup edge length of every filter program.
pub const FILTER_WORKGROUP: u32 = 8;

impl ImageFilter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GaussianBlur { .. } => "gaussian blur",
            Self::Sobel => "sobel",
            Self::Threshold { .. } => "threshold",
        }
    }

    /// Parameter block: value, radius and two words of padding.
    pub fn params(&self) -> [u32; 4] {
        let (value, radius) = match *self {
            Self::GaussianBlur { sigma } => {
                let sigma = sigma.max(0.01);
                (sigma, (sigma * 3.0).ceil().clamp(1.0, 32.0) as u32)
            }
            Self::Sobel => (0.0, 1),
            Self::Threshold { level } => (level, 0),
        };
        [value.to_bits(), radius, 0, 0]
    }

    /// WGSL program for a destination of `format`.
    pub fn source(&self, format: PixelFormat) -> Option<String> {
        let storage = format.storage_name()?;
        let body = match self {
            Self::GaussianBlur { .. } => BLUR_BODY,
            Self::Sobel => SOBEL_BODY,
            Self::Threshold { .. } => THRESHOLD_BODY,
        };
        Some(format!(
            "{PRELUDE}@group(0) @binding(1) var dst: texture_storage_2d<{storage}, write>;\n\n\
             @compute @workgroup_size({FILTER_WORKGROUP}, {FILTER_WORKGROUP}, 1)\n\
             fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n\
             \x20   let size = textureDimensions(dst);\n\
             \x20   if (gid.x >= size.x || gid.y >= size.y) {{ return; }}\n\
             \x20   let coord = vec2<i32>(gid.xy);\n\
             {body}\
             }}\n"
        ))
    }
}

const PRELUDE: &str = r#"struct FilterParams {
    value: f32,
    radius: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(2) var<uniform> params: FilterParams;

fn fetch(coord: vec2<i32>) -> vec4<f32> {
    let limit = vec2<i32>(textureDimensions(src)) - vec2<i32>(1);
    return textureLoad(src, clamp(coord, vec2<i32>(0), limit), 0);
}

fn luma(color: vec4<f32>) -> f32 {
    return dot(color.rgb, vec3<f32>(0.2126, 0.7152, 0.0722));
}

"#;

const BLUR_BODY: &str = r#"    let r = i32(params.radius);
    let denom = 2.0 * params.value * params.value;
    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var y = -r; y <= r; y++) {
        for (var x = -r; x <= r; x++) {
            let w = exp(-f32(x * x + y * y) / denom);
            sum += fetch(coord + vec2<i32>(x, y)) * w;
            total += w;
        }
    }
    textureStore(dst, coord, sum / total);
"#;

const SOBEL_BODY: &str = r#"    var l: array<f32, 9>;
    for (var i = 0; i < 9; i++) {
        l[i] = luma(fetch(coord + vec2<i32>(i % 3 - 1, i / 3 - 1)));
    }
    let gx = (l[2] + 2.0 * l[5] + l[8]) - (l[0] + 2.0 * l[3] + l[6]);
    let gy = (l[6] + 2.0 * l[7] + l[8]) - (l[0] + 2.0 * l[1] + l[2]);
    let m = sqrt(gx * gx + gy * gy);
    textureStore(dst, coord, vec4<f32>(m, m, m, 1.0));
"#;

const THRESHOLD_BODY: &str = r#"    let c = fetch(coord);
    let v = select(0.0, 1.0, luma(c) >= params.value);
    textureStore(dst, coord, vec4<f32>(v, v, v, c.a));
"#;
