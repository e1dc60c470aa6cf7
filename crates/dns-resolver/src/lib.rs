#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::wildcard_imports)]

pub mod forwarding;
pub mod iterative;
pub mod util;

use async_trait::async_trait;

use dns_types::protocol::types::Question;

pub use self::forwarding::ForwardingResolver;
pub use self::iterative::IterativeResolver;
pub use self::util::types::{ResolutionFailure, ResolutionOutcome};

/// Something which can answer a single question.
///
/// A resolver never fails outright: errors are folded into the
/// `ResolutionOutcome`.  `CNAME`s are not followed: an alias comes
/// back as `ResolutionOutcome::Chain` and it is up to the caller
/// whether to resolve the target.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, question: &Question) -> ResolutionOutcome;
}
