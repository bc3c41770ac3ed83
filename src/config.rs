//! On-disk description of a batch of transformations to run against one
//! image, loaded from TOML via `serde`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchJob {
    /// Path to the iBoot image to patch.
    pub image: String,
    /// Where to write the patched image; defaults to `<image>.patched`.
    #[serde(default)]
    pub out: Option<String>,
    #[serde(default)]
    pub boot_args: Option<String>,
    #[serde(default)]
    pub debug_enabled: bool,
    #[serde(default)]
    pub sigcheck: bool,
    #[serde(default)]
    pub demotion: bool,
    #[serde(default)]
    pub unlock_nvram: bool,
    #[serde(default)]
    pub nvram_nosave: bool,
    #[serde(default)]
    pub nvram_noremove: bool,
    #[serde(default)]
    pub freshnonce: bool,
    #[serde(default)]
    pub bgcolor_memcpy: bool,
    #[serde(default)]
    pub ra1nra1n: bool,
    #[serde(default)]
    pub cmd_handlers: Vec<CmdHandlerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdHandlerSpec {
    pub cmd: String,
    pub ptr: u64,
}

impl PatchJob {
    pub fn load(path: &Path) -> Result<PatchJob> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::InvalidImage(format!("reading job file {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| Error::InvalidImage(format!("parsing job file: {e}")))
    }

    pub fn output_path(&self) -> String {
        self.out.clone().unwrap_or_else(|| format!("{}.patched", self.image))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_job() {
        let toml = r#"
            image = "iBoot.bin"
            boot_args = "-v"
            debug_enabled = true
        "#;
        let job: PatchJob = toml::from_str(toml).unwrap();
        assert_eq!(job.image, "iBoot.bin");
        assert_eq!(job.boot_args.as_deref(), Some("-v"));
        assert!(job.debug_enabled);
        assert!(!job.sigcheck);
        assert_eq!(job.output_path(), "iBoot.bin.patched");
    }

    #[test]
    fn parses_cmd_handlers() {
        let toml = r#"
            image = "iBoot.bin"
            [[cmd_handlers]]
            cmd = "bgcolor"
            ptr = 3735928559
        "#;
        let job: PatchJob = toml::from_str(toml).unwrap();
        assert_eq!(job.cmd_handlers.len(), 1);
        assert_eq!(job.cmd_handlers[0].cmd, "bgcolor");
    }
}
