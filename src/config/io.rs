//! Environment-based settings loading.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;

use super::Settings;

/// Build a settings snapshot from the process environment.
///
/// A `.env` file is honoured when present. Variables are read under the
/// `ARBOR_` prefix (e.g. `ARBOR_BASE_MODEL`, `ARBOR_WCD_URL`,
/// `ARBOR_OPENAI_APIKEY`) and passed through [`Settings::configure`], so
/// the same option names and API-key collection rules apply.
pub fn load_from_env() -> Result<Settings> {
    dotenvy::dotenv().ok();

    let raw: BTreeMap<String, String> = config::Config::builder()
        .add_source(config::Environment::with_prefix("ARBOR"))
        .build()?
        .try_deserialize()?;

    let mut settings = Settings::default();
    settings.configure(
        raw.into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    Ok(settings)
}
