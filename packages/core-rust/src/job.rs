//! Units of work executed by workers.

use async_trait::async_trait;

/// A named, cancellable unit of work.
///
/// A job is executed by exactly one [`Worker`](crate::Worker) at a time.
/// `kill` may be called from another task while `run` is in flight; honoring
/// it is up to the job. Jobs that ignore it keep their worker busy until
/// `run` returns on its own.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Identifying name used in logs. Defaults to the implementing type's
    /// name without its module path or generic parameters.
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }

    /// Executes the job to completion.
    async fn run(&self);

    /// Requests cooperative cancellation of an in-flight `run`.
    fn kill(&self);
}

/// `a::b::Foo<c::Bar>` -> `Foo`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
