// src/protocol/script.rs

//! Image-source registration script.
//!
//! The viewer evaluates this block remotely. It is idempotent per media id:
//! when a source with the same media name already exists it appends a new
//! frame to it instead of creating a second source. The block evaluates to
//! `<tag>:<frame>`, the registration's tag and the frame number the tiles
//! must be sent to, which comes back as `RETURN <tag>:<frame>`.

use std::fmt::Write as _;

use crate::color::ColorCorrection;
use crate::pixels::CHANNELS;

/// Display node that receives color-correction properties.
const DISPLAY_NODE: &str = "#RVDisplayColor";

/// Everything the viewer needs to allocate an image source.
#[derive(Debug, Clone)]
pub struct ImageSourceDescriptor<'a> {
    pub media: &'a str,
    /// Display window size.
    pub width: u32,
    pub height: u32,
    /// AOV names, one viewer layer each.
    pub layers: &'a [String],
    pub color: &'a ColorCorrection,
    /// Echoed back with the reply so late answers can be told apart.
    pub tag: u64,
}

/// Builds the remote-evaluation block for `desc`.
pub fn registration_script(desc: &ImageSourceDescriptor<'_>) -> String {
    let layers = desc
        .layers
        .iter()
        .map(|l| quote(l))
        .collect::<Vec<_>>()
        .join(",");

    let mut existing_pixels = String::new();
    let mut new_pixels = String::new();
    for layer in desc.layers {
        let _ = writeln!(
            existing_pixels,
            "      newImageSourcePixels(source, frame, {}, nil);",
            quote(layer)
        );
        let _ = writeln!(
            new_pixels,
            "  newImageSourcePixels(s, 1, {}, nil);",
            quote(layer)
        );
    }

    let mut script = String::new();
    let _ = writeln!(script, "{{");
    let _ = writeln!(script, "  string media = {};", quote(desc.media));
    let _ = writeln!(script, "  int tag = {};", desc.tag);
    let _ = writeln!(script, "  int frame = 1;");
    let _ = writeln!(script, "  bool found = false;");
    let _ = writeln!(script, "  for_each (source; nodesOfType(\"RVImageSource\")) {{");
    let _ = writeln!(
        script,
        "    if (getStringProperty(\"%s.media.name\" % source)[0] == media) {{"
    );
    let _ = writeln!(script, "      found = true;");
    let _ = writeln!(
        script,
        "      frame = getIntProperty(\"%s.image.end\" % source)[0] + 1;"
    );
    let _ = writeln!(
        script,
        "      setIntProperty(\"%s.image.end\" % source, int[] {{frame}});"
    );
    script.push_str(&existing_pixels);
    let _ = writeln!(script, "      setFrameEnd(frame);");
    let _ = writeln!(script, "      setFrame(frame);");
    let _ = writeln!(script, "      break;");
    let _ = writeln!(script, "    }}");
    let _ = writeln!(script, "  }}");
    let _ = writeln!(script, "  if (!found) {{");
    // name, w, h, uncrop w, uncrop h, uncrop x, uncrop y, pixel aspect,
    // channels, bit depth, nofloat, start, end, fps, layers, views
    let _ = writeln!(
        script,
        "  let s = newImageSource(media, {w}, {h}, {w}, {h}, 0, 0, 1.0, {c}, 32, false, 1, 1, 24.0, string[] {{{layers}}}, nil);",
        w = desc.width,
        h = desc.height,
        c = CHANNELS,
        layers = layers
    );
    script.push_str(&new_pixels);
    let _ = writeln!(script, "  setViewNode(nodeGroup(s));");
    let _ = writeln!(script, "  }}");
    script.push_str(&display_commands(desc.color));
    let _ = writeln!(script, "  string(tag) + \":\" + string(frame);");
    script.push('}');
    script
}

/// Viewer-side commands applying `color` to the display.
pub fn display_commands(color: &ColorCorrection) -> String {
    match color {
        ColorCorrection::None => String::new(),
        ColorCorrection::Srgb => format!(
            "  setIntProperty(\"{}.color.sRGB\", int[] {{1}}, true);\n",
            DISPLAY_NODE
        ),
        ColorCorrection::Rec709 => format!(
            "  setIntProperty(\"{}.color.Rec709\", int[] {{1}}, true);\n",
            DISPLAY_NODE
        ),
        // Debug keeps the decimal point and the shortest exact digits.
        ColorCorrection::Gamma(gamma) => format!(
            "  setFloatProperty(\"{}.color.gamma\", float[] {{{:?}}}, true);\n",
            DISPLAY_NODE, gamma
        ),
        ColorCorrection::Lut(path) => format!(
            "  readLUT({}, \"{node}\", true);\n  setIntProperty(\"{node}.lut.active\", int[] {{1}}, true);\n",
            quote(&path.display().to_string()),
            node = DISPLAY_NODE
        ),
        // Handled by the mode package the viewer was launched with.
        ColorCorrection::Ocio(_) => String::new(),
    }
}

/// Quotes `s` as a script string literal.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
