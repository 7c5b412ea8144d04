//! Turns loosely typed request parameters into a bounded [`EffectParameters`]
//! and renders the ffmpeg argument list for the degradation pipeline.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;

use serde::Serialize;

/// Width every output is scaled back up to with nearest-neighbour sampling.
pub const OUTPUT_WIDTH: u32 = 1280;

pub const PRESET_KEY: &str = "preset";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectParameters {
    pub frame_rate: f64,
    pub crunch_width: u32,
    pub grain: f64,
    pub contrast: f64,
    pub brightness: f64,
    pub gamma: f64,
    pub saturation: f64,
    pub quality: u32,
}

impl Default for EffectParameters {
    fn default() -> Self {
        EffectParameters {
            frame_rate: FRAME_RATE.default,
            crunch_width: CRUNCH_WIDTH.default as u32,
            grain: GRAIN.default,
            contrast: CONTRAST.default,
            brightness: BRIGHTNESS.default,
            gamma: GAMMA.default,
            saturation: SATURATION.default,
            quality: QUALITY.default as u32,
        }
    }
}

pub struct Field {
    pub aliases: &'static [&'static str],
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub integer: bool,
}

pub const FRAME_RATE: Field = Field {
    aliases: &["fps", "frameRate", "framerate", "frame_rate"],
    min: 4.0,
    max: 30.0,
    default: 12.0,
    integer: false,
};

pub const CRUNCH_WIDTH: Field = Field {
    aliases: &["crunch", "crunchWidth", "crunch_width", "width"],
    min: 180.0,
    max: 960.0,
    default: 480.0,
    integer: true,
};

pub const GRAIN: Field = Field {
    aliases: &["grain", "noise"],
    min: 0.0,
    max: 30.0,
    default: 14.0,
    integer: false,
};

pub const CONTRAST: Field = Field {
    aliases: &["contrast"],
    min: 0.8,
    max: 1.6,
    default: 1.2,
    integer: false,
};

pub const BRIGHTNESS: Field = Field {
    aliases: &["brightness"],
    min: -0.2,
    max: 0.2,
    default: 0.02,
    integer: false,
};

pub const GAMMA: Field = Field {
    aliases: &["gamma"],
    min: 0.7,
    max: 1.4,
    default: 1.0,
    integer: false,
};

pub const SATURATION: Field = Field {
    aliases: &["saturation", "sat"],
    min: 0.0,
    max: 1.5,
    default: 0.8,
    integer: false,
};

pub const QUALITY: Field = Field {
    aliases: &["crf", "quality"],
    min: 18.0,
    max: 35.0,
    default: 28.0,
    integer: true,
};

impl Field {
    fn resolve(&self, raw: &RawParameters, fallback: f64) -> f64 {
        let value = self
            .aliases
            .iter()
            .find_map(|alias| raw.get(alias))
            .and_then(|text| text.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(fallback);

        let value = if self.integer { value.round() } else { value };

        value.clamp(self.min, self.max)
    }
}

/// Request parameters keyed by whatever name the client used.
#[derive(Debug, Clone, Default)]
pub struct RawParameters {
    values: HashMap<String, String>,
}

impl RawParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first occurrence of a repeated key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Present and non-empty after trimming.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut raw = RawParameters::new();
        for (key, value) in iter {
            raw.insert(key, value);
        }
        raw
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Preset {
    pub name: &'static str,
    pub values: EffectParameters,
}

pub static PRESETS: [Preset; 4] = [
    Preset {
        name: "punk-camcorder",
        values: EffectParameters {
            frame_rate: 12.0,
            crunch_width: 320,
            grain: 22.0,
            contrast: 1.25,
            brightness: 0.02,
            gamma: 1.05,
            saturation: 0.75,
            quality: 30,
        },
    },
    Preset {
        name: "washed-dv",
        values: EffectParameters {
            frame_rate: 15.0,
            crunch_width: 480,
            grain: 14.0,
            contrast: 1.05,
            brightness: 0.04,
            gamma: 1.1,
            saturation: 0.65,
            quality: 28,
        },
    },
    Preset {
        name: "brutal-bw",
        values: EffectParameters {
            frame_rate: 12.0,
            crunch_width: 360,
            grain: 18.0,
            contrast: 1.45,
            brightness: -0.02,
            gamma: 0.95,
            saturation: 0.0,
            quality: 29,
        },
    },
    Preset {
        name: "hi-grime",
        values: EffectParameters {
            frame_rate: 10.0,
            crunch_width: 240,
            grain: 28.0,
            contrast: 1.3,
            brightness: 0.0,
            gamma: 1.0,
            saturation: 0.85,
            quality: 34,
        },
    },
];

fn normalize_preset_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_' | '&'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Looks a preset up by name, ignoring case and separators ("BRUTAL B&W" finds "brutal-bw").
pub fn find_preset(name: &str) -> Option<&'static Preset> {
    let wanted = normalize_preset_name(name);
    PRESETS
        .iter()
        .find(|preset| normalize_preset_name(preset.name) == wanted)
}

/// Never fails: missing or unparseable values take the default, everything is clamped.
pub fn compile(raw: &RawParameters) -> EffectParameters {
    let base = raw
        .get(PRESET_KEY)
        .and_then(find_preset)
        .map(|preset| preset.values)
        .unwrap_or_default();

    EffectParameters {
        frame_rate: FRAME_RATE.resolve(raw, base.frame_rate),
        crunch_width: CRUNCH_WIDTH.resolve(raw, base.crunch_width as f64) as u32,
        grain: GRAIN.resolve(raw, base.grain),
        contrast: CONTRAST.resolve(raw, base.contrast),
        brightness: BRIGHTNESS.resolve(raw, base.brightness),
        gamma: GAMMA.resolve(raw, base.gamma),
        saturation: SATURATION.resolve(raw, base.saturation),
        quality: QUALITY.resolve(raw, base.quality as f64) as u32,
    }
}

/// The comma-separated `-vf` chain. Stage order matters: the grain goes on last
/// so neither the upscale nor the colour stage touches it.
pub fn filter_chain(params: &EffectParameters) -> String {
    [
        format!("fps={}", params.frame_rate),
        format!("scale={}:-2", params.crunch_width),
        format!("scale={OUTPUT_WIDTH}:-2:flags=neighbor"),
        format!(
            "eq=contrast={}:brightness={}:gamma={}:saturation={}",
            params.contrast, params.brightness, params.gamma, params.saturation
        ),
        format!("noise=alls={}:allf=t+u", params.grain),
    ]
    .join(",")
}

pub fn render_arguments(params: &EffectParameters, input: &Path, output: &Path) -> Vec<OsString> {
    let mut arguments: Vec<OsString> = [
        "-hide_banner",
        "-nostdin",
        "-nostats",
        "-loglevel",
        "error",
        "-y",
        "-i",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    arguments.push(input.as_os_str().to_owned());

    arguments.extend(
        [
            "-map".to_owned(),
            "0:v:0".to_owned(),
            "-map".to_owned(),
            "0:a?".to_owned(),
            "-vf".to_owned(),
            filter_chain(params),
            "-c:v".to_owned(),
            "libx264".to_owned(),
            "-preset".to_owned(),
            "veryfast".to_owned(),
            "-crf".to_owned(),
            params.quality.to_string(),
            "-pix_fmt".to_owned(),
            "yuv420p".to_owned(),
            "-c:a".to_owned(),
            "aac".to_owned(),
            "-b:a".to_owned(),
            "128k".to_owned(),
            "-movflags".to_owned(),
            "+faststart".to_owned(),
        ]
        .into_iter()
        .map(OsString::from),
    );

    arguments.push(output.as_os_str().to_owned());

    arguments
}
