//! Prefixed random identifiers (`int_x3k9...`, `exec_a81f...`)

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of the random suffix on generated ids.
const SUFFIX_LEN: usize = 12;

/// Generate a prefixed id: `<prefix>_<12 lowercase alphanumerics>`.
pub fn random_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{prefix}_{suffix}")
}
