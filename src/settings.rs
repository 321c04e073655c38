//! Runtime settings: built as JSON, shipped as a `settings.js` module.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::channel::BuildMode;
use crate::generator::FLOWS_FILE;

const SETTINGS_PREFIX: &str = "module.exports = ";
const SETTINGS_SUFFIX: &str = ";\n";

/// Locked-down runtime settings: no editor, no admin API, no module
/// installs. `env` gets `GJ_BUILD_MODE` on top of the given variables.
pub fn build_settings(env: &BTreeMap<String, String>, mode: BuildMode) -> Value {
    let mut env = env.clone();
    env.insert("GJ_BUILD_MODE".to_string(), mode.to_string());
    json!({
        "flowFile": FLOWS_FILE,
        "disableEditor": true,
        "httpAdminRoot": false,
        "requireHttps": mode == BuildMode::Production,
        "externalModules": {
            "autoInstall": false,
            "palette": {"allowInstall": false},
            "modules": {"allowInstall": false},
        },
        "functionExternalModules": false,
        "env": env,
    })
}

pub fn render_settings(settings: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_string_pretty(settings)?;
    Ok(format!("{}{}{}", SETTINGS_PREFIX, body, SETTINGS_SUFFIX).into_bytes())
}

pub fn parse_settings(bytes: &[u8]) -> Result<Value, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
    let body = text
        .strip_prefix(SETTINGS_PREFIX)
        .and_then(|t| t.trim_end().strip_suffix(';'))
        .ok_or_else(|| "expected 'module.exports = {...};'".to_string())?;
    serde_json::from_str(body).map_err(|e| e.to_string())
}
