use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Tag;
use crate::api::ApiRequest;

/// A named remote operation with declared argument and result types.
///
/// The store keys and caches the raw JSON; decoding into `Output` happens at
/// the caller's edge, so a shape mismatch surfaces as
/// [`ApiError::InvalidResponse`](crate::api::ApiError::InvalidResponse)
/// without affecting other callers.
pub trait Endpoint: Send + Sync + 'static {
    type Args: Serialize + Clone + Send + Sync + 'static;
    type Output: DeserializeOwned;

    fn name(&self) -> &'static str;

    fn request(&self, args: &Self::Args) -> ApiRequest;
}

/// A read whose result can be cached and shared.
pub trait QueryEndpoint: Endpoint + Clone {
    /// Tags provided by a successful result; invalidating any of them makes
    /// the cached result stale.
    fn provides_tags(&self, _args: &Self::Args, _output: &Self::Output) -> Vec<Tag> {
        Vec::new()
    }
}
