//! Where btop looks for its config file and themes.
//!
//! btop4win keeps everything next to the executable; the Unix builds use
//! `~/.config/btop` and also read themes shipped alongside the binary.

use std::path::{Path, PathBuf};

use crate::platform::Platform;

pub const CONFIG_FILE_NAME: &str = "btop.conf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtopPaths {
    pub config_file: PathBuf,
    /// Directory downloaded themes are written to.
    pub theme_dir: PathBuf,
    /// Themes shipped in the release archive, if the layout has any.
    pub bundled_theme_dir: Option<PathBuf>,
    /// Every directory btop reads themes from, in search order.
    pub theme_search_dirs: Vec<PathBuf>,
}

impl BtopPaths {
    pub fn resolve(platform: &Platform, home_dir: &Path, executable: &Path) -> Self {
        let exe_dir = executable.parent().unwrap_or(Path::new("."));

        if platform.is_windows() {
            let theme_dir = exe_dir.join("themes");
            return Self {
                config_file: exe_dir.join(CONFIG_FILE_NAME),
                theme_dir: theme_dir.clone(),
                bundled_theme_dir: Some(theme_dir.clone()),
                theme_search_dirs: vec![theme_dir],
            };
        }

        // <prefix>/bin/btop next to <prefix>/themes and <prefix>/share/btop/themes
        let prefix = exe_dir.parent().unwrap_or(exe_dir);
        let bundled = prefix.join("themes");
        let shared = prefix.join("share").join("btop").join("themes");
        let user_dir = home_dir.join(".config").join("btop");
        let theme_dir = user_dir.join("themes");

        Self {
            config_file: user_dir.join(CONFIG_FILE_NAME),
            theme_dir: theme_dir.clone(),
            bundled_theme_dir: Some(bundled.clone()),
            theme_search_dirs: vec![bundled, shared, theme_dir],
        }
    }
}
