//! WGSL validation using the naga library.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("WGSL parse failed:\n{0}")]
    Parse(String),
    #[error("WGSL validation failed: {message}\n{listing}")]
    Invalid { message: String, listing: String },
}

/// Parse and validate WGSL source code.
///
/// Returns the naga module on success. Failures carry a line-numbered
/// listing of the source so generated programs can be inspected.
pub fn validate_wgsl(source: &str) -> Result<naga::Module, ValidationError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| ValidationError::Parse(e.emit_to_string(source)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| ValidationError::Invalid {
        message: e.as_inner().to_string(),
        listing: numbered(source),
    })?;
    Ok(module)
}

/// Validate a generated unit and log which one failed.
pub fn validate_unit(label: &str, source: &str) -> Result<naga::Module, ValidationError> {
    validate_wgsl(source).inspect_err(|e| tracing::error!("unit '{label}' generated invalid WGSL: {e}"))
}

fn numbered(source: &str) -> String {
    let mut output = String::from("---\n");
    for (line_num, line) in source.lines().enumerate() {
        output.push_str(&format!("{:4} | {}\n", line_num + 1, line));
    }
    output.push_str("---\n");
    output
}
