use crate::image_reference::ParseError;
use crate::oci_registry::TransportError;

/// Failures a single reconcile can surface. Every variant carries the object
/// or image context so the controller loop can log something actionable; none
/// of them is swallowed inside the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed image string. Retrying with the same input cannot succeed,
    /// only a change to the owning object can.
    #[error("invalid image reference {image:?}: {source}")]
    ReferenceParse { image: String, source: ParseError },

    /// Network, auth, or IO failure talking to a registry. Retried by the
    /// external delivery layer.
    #[error("registry transport failure for {reference}: {source}")]
    RegistryTransport {
        reference: String,
        source: TransportError,
    },

    #[error("failed to fetch {kind} {key}: {source}")]
    ObjectFetch {
        kind: String,
        key: String,
        source: kube::Error,
    },

    #[error("failed to update {kind} {key}: {source}")]
    ObjectUpdate {
        kind: String,
        key: String,
        source: kube::Error,
    },
}
