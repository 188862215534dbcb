//! The CGI handler: resolve the script, merge the environment, run it.
use crate::env::{EnvironmentSet, InheritedEnv};
use crate::gateway::{respond_error, Completion, GatewayRequest, Handler, ResponseWriter};
use crate::runner::{run_script, StderrMode};
use crate::script::{resolve_script, ScriptPolicy};

/// Serves every request by executing the script it names.
#[derive(Debug)]
pub struct CgiResponder {
    inherited: InheritedEnv,
    policy: ScriptPolicy,
    stderr: StderrMode,
}

impl CgiResponder {
    /// `inherited` is captured once; the host environment is not re-read per request.
    pub fn new(inherited: InheritedEnv, policy: ScriptPolicy, stderr: StderrMode) -> Self {
        CgiResponder {
            inherited,
            policy,
            stderr,
        }
    }
}

impl Handler for CgiResponder {
    fn serve(&self, req: GatewayRequest, w: &mut dyn ResponseWriter) -> Completion {
        let script = match resolve_script(&req.params, self.policy) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting request");
                if let Err(we) = respond_error(w, 403, &e.to_string()) {
                    tracing::debug!(error = %we, "writing error response failed");
                }
                return Completion::Rejected;
            }
        };
        let env = EnvironmentSet::merge(&req.params, &self.inherited);
        run_script(&script, &env, req, w, self.stderr)
    }
}
