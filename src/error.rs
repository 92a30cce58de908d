use snafu::Snafu;

/// Transport-level error for the volume RPC surface.
///
/// Errors of this type correspond to a failed RPC exchange, as opposed to the
/// error variants embedded inside replies which travel over a successful
/// exchange. The interception layer itself never creates these, it only
/// propagates what the state oracle or the downstream service returned.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum SvcError {
    #[snafu(display("Volume state query '{}' failed: {}", query, reason))]
    ProviderQuery { query: String, reason: String },
    #[snafu(display("Volume service failed to serve '{}': {}", method, reason))]
    Handler { method: String, reason: String },
    #[snafu(display("'{}' timed out after {:?}", method, timeout))]
    Timeout {
        method: String,
        timeout: std::time::Duration,
    },
}
