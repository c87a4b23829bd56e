//! Runtime for platforms without sandbox support: refuses every job
//! rather than running one unisolated.

use super::{ExecOutcome, ExecSpec, SandboxError, SandboxRuntime};

#[derive(Debug, Default)]
pub struct StubSandbox;

impl SandboxRuntime for StubSandbox {
    fn run(&self, _spec: ExecSpec) -> Result<ExecOutcome, SandboxError> {
        Err(SandboxError::Unsupported(
            "native isolation requires Linux namespaces",
        ))
    }
}
