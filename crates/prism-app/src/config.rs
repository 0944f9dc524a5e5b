// SPDX-License-Identifier: CEPL-1.0
//! `prism.toml` plus command-line overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use prism_platform::WindowDesc;
use prism_render_vk::{vk, DevicePreference, PresentModePolicy, SceneKind, VkOptions};
use serde::Deserialize;
use tracing::{debug, info};

pub const DEFAULT_PATH: &str = "prism.toml";

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ./prism.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Initial window width in pixels
    #[arg(long)]
    pub width: Option<u32>,
    /// Initial window height in pixels
    #[arg(long)]
    pub height: Option<u32>,
    /// What to draw each frame
    #[arg(long, value_enum)]
    pub scene: Option<SceneCfg>,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
    pub device: DeviceCfg,
    pub present: PresentCfg,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowCfg {
    fn default() -> Self {
        let d = WindowDesc::default();
        Self {
            title: d.title,
            width: d.width,
            height: d.height,
            resizable: d.resizable,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub scene: SceneCfg,
    #[serde(default)]
    pub frame_timeout_ms: Option<u64>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            clear_color: default_clear(),
            scene: SceneCfg::default(),
            frame_timeout_ms: None,
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.125, 0.125, 0.125, 1.0]
}

#[derive(Debug, Clone, Copy, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SceneCfg {
    Clear,
    Triangle,
}

impl Default for SceneCfg {
    fn default() -> Self {
        if cfg!(feature = "triangle") {
            SceneCfg::Triangle
        } else {
            SceneCfg::Clear
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceCfg {
    pub preference: PreferenceCfg,
    pub require_compute: bool,
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            preference: PreferenceCfg::Discrete,
            require_compute: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceCfg {
    #[default]
    Discrete,
    Integrated,
    Any,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PresentCfg {
    pub mode: PresentModeCfg,
    pub strict: bool,
}

impl Default for PresentCfg {
    fn default() -> Self {
        Self {
            mode: PresentModeCfg::Mailbox,
            strict: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
    FifoRelaxed,
}

impl PresentModeCfg {
    fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentModeCfg::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeCfg::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeCfg::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentModeCfg::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        // a zero wait would time out every frame; omit the key to wait forever
        if self.render.frame_timeout_ms == Some(0) {
            bail!("render.frame_timeout_ms must be greater than 0");
        }
        Ok(())
    }

    /// An explicit `--config` must exist; the default path may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.unwrap_or(Path::new(DEFAULT_PATH));
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if explicit.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no {DEFAULT_PATH}; using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let cfg = Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!("config loaded from {}", path.display());
        Ok(cfg)
    }

    /// File values first, CLI on top.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut cfg = Self::load(cli.config.as_deref())?;
        cfg.apply(cli);
        Ok(cfg)
    }

    pub fn apply(&mut self, cli: &Cli) {
        if let Some(w) = cli.width {
            self.window.width = w;
        }
        if let Some(h) = cli.height {
            self.window.height = h;
        }
        if let Some(scene) = cli.scene {
            self.render.scene = scene;
        }
    }

    pub fn window_desc(&self) -> WindowDesc {
        WindowDesc {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
            resizable: self.window.resizable,
        }
    }

    pub fn vk_options(&self) -> VkOptions {
        VkOptions {
            device: match self.device.preference {
                PreferenceCfg::Discrete => DevicePreference::Discrete,
                PreferenceCfg::Integrated => DevicePreference::Integrated,
                PreferenceCfg::Any => DevicePreference::Any,
            },
            require_compute: self.device.require_compute,
            present: PresentModePolicy {
                mode: self.present.mode.to_vk(),
                strict: self.present.strict,
            },
            clear_color: self.render.clear_color,
            frame_timeout_ms: self.render.frame_timeout_ms,
            scene: match self.render.scene {
                SceneCfg::Clear => SceneKind::Clear,
                SceneCfg::Triangle => SceneKind::Triangle,
            },
        }
    }
}
