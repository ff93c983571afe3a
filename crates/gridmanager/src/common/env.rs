use bstr::{BStr, ByteSlice};

const GM_ENV_PREFIX: &str = "GM_";

macro_rules! create_gm_env {
    ($name: literal) => {
        concat!("GM_", $name)
    };
}

pub fn is_gm_env(name: &BStr) -> bool {
    name.starts_with(GM_ENV_PREFIX.as_bytes())
}

/// Environment variable for a configuration knob (`submit_interval` -> `GM_SUBMIT_INTERVAL`).
pub fn knob_env_name(knob: &str) -> String {
    format!("{GM_ENV_PREFIX}{}", knob.to_ascii_uppercase())
}

/// Known environment variables
pub const GM_CONFIG: &str = create_gm_env!("CONFIG");
pub const GM_DEBUG: &str = create_gm_env!("DEBUG");
pub const GM_SCRATCH_DIR: &str = create_gm_env!("SCRATCH_DIR");
pub const GM_REPORT_TO: &str = create_gm_env!("REPORT_TO");
/// Passed to helper processes so that they can find their owner's log.
pub const GM_PARENT_PID: &str = create_gm_env!("PARENT_PID");
