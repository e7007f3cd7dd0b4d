use std::future::Future;
use std::time::Duration;

/// Run a hypervisor call under a deadline. An elapsed deadline surfaces as
/// [`pvm_infra::Error::Timeout`] like any other remote failure.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = pvm_infra::Result<T>>,
) -> pvm_infra::Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(pvm_infra::Error::Timeout(limit)),
    }
}
