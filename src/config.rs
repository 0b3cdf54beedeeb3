// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use serde::Deserialize;

/// The `[backend.x11]` section of the compositor configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct X11BackendConfig {
    /// Overrides the DISPLAY environment variable.
    pub display: Option<String>,
    /// The _NET_WM_NAME of presented windows.
    pub title: String,
    pub width: u16,
    pub height: u16,
}

impl Default for X11BackendConfig {
    fn default() -> Self {
        Self {
            display: None,
            title: "Vitrine Compositor".to_string(),
            width: 1024,
            height: 640,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_partial_config() {
        let cfg: X11BackendConfig = toml::from_str(
            r#"
            display = ":1"
            width = 1920
            height = 1080
            "#,
        )
        .unwrap();

        assert_eq!(cfg.display.as_deref(), Some(":1"));
        assert_eq!((cfg.width, cfg.height), (1920, 1080));
        assert_eq!(cfg.title, X11BackendConfig::default().title);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<X11BackendConfig>("fullscreen = true").is_err());
    }
}
