//! Validate command for checking configuration consistency.

use std::io::Write;

use anyhow::Result;

use tally_core::TagSet;

use crate::Config;

/// Reports every configuration problem. Returns whether the
/// configuration is usable.
pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<bool> {
    let findings = collect_findings(config);
    if findings.is_empty() {
        writeln!(writer, "configuration ok")?;
        return Ok(true);
    }
    for finding in &findings {
        writeln!(writer, "error: {finding}")?;
    }
    Ok(false)
}

fn collect_findings(config: &Config) -> Vec<String> {
    let mut findings = Vec::new();
    findings.extend(
        config
            .engine
            .issues()
            .iter()
            .map(|issue| format!("engine: {issue}")),
    );
    findings.extend(
        config
            .presence
            .issues()
            .iter()
            .map(|issue| format!("presence: {issue}")),
    );
    findings.extend(
        config
            .rules
            .issues()
            .iter()
            .map(|issue| format!("rules: {issue}")),
    );
    for (app, names) in &config.resolver.apps {
        if let Err(err) = TagSet::from_names(names.iter().cloned()) {
            findings.push(format!("resolver.apps.{app}: {err}"));
        }
    }
    findings
}
