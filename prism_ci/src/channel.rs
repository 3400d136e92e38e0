//! Client side of code installation.
//!
//! The channel negotiates which optional sections to encode, serializes the
//! artifact and submits it together with the speculation snapshot the
//! compiler consulted. The outcome comes back as an [`InstallOutcome`];
//! only protocol defects surface as [`InstallError`].

use prism_ci_wire::{ArtifactEncoder, CompiledArtifact, EncodedStream, EncodingFlags};
use tracing::{debug, trace, warn};

use crate::boundary::SharedRuntime;
use crate::config::ClientConfig;
use crate::error::InstallError;
use crate::installed_code::InstalledCode;
use crate::outcome::InstallOutcome;
use crate::speculation::LogAddress;

/// Submits compiled artifacts to a runtime.
#[derive(Clone)]
pub struct InstallChannel {
    runtime: SharedRuntime,
    config: ClientConfig,
}

impl InstallChannel {
    /// Create a channel to `runtime`.
    pub fn new(runtime: SharedRuntime, config: ClientConfig) -> Self {
        Self { runtime, config }
    }

    /// The runtime behind the channel.
    #[inline]
    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Client configuration.
    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sections the next stream will carry.
    pub fn encoding_flags(&self) -> EncodingFlags {
        EncodingFlags::negotiate(self.runtime.install_flags(), self.config.type_info_override)
    }

    /// Encoder configured for the runtime's protocol version and chunk size.
    pub fn encoder(&self) -> ArtifactEncoder {
        ArtifactEncoder::new(self.encoding_flags())
            .with_protocol_version(self.runtime.protocol_version())
            .with_chunk_size(self.runtime.stream_chunk_size())
    }

    /// Encode `artifact` for this runtime.
    pub fn encode(&self, artifact: &CompiledArtifact) -> Result<EncodedStream, InstallError> {
        Ok(self.encoder().encode(artifact)?)
    }

    /// Encode and submit `artifact`, populating `handle` on success.
    ///
    /// `speculation_log` is the unit's log address, or [`LogAddress::NULL`]
    /// if the compilation never obtained one.
    pub fn install(
        &self,
        artifact: &CompiledArtifact,
        handle: &InstalledCode,
        speculation_log: LogAddress,
    ) -> Result<InstallOutcome, InstallError> {
        let stream = self.encode(artifact)?;
        trace!(
            unit = artifact.unit().as_u64(),
            compile_id = artifact.compile_id().as_u32(),
            bytes = stream.byte_len(),
            chunks = stream.chunk_count(),
            pool = stream.pool().len(),
            "encoded artifact"
        );
        self.install_stream(stream, artifact, handle, speculation_log)
    }

    /// Submit an already encoded stream for `artifact`. The stream is
    /// consumed by this submission.
    pub fn install_stream(
        &self,
        stream: EncodedStream,
        artifact: &CompiledArtifact,
        handle: &InstalledCode,
        speculation_log: LogAddress,
    ) -> Result<InstallOutcome, InstallError> {
        let result = self.runtime.install_code(
            stream,
            handle,
            speculation_log,
            artifact.speculation_snapshot(),
        );
        match &result {
            Ok(outcome) => debug!(
                unit = artifact.unit().as_u64(),
                compile_id = artifact.compile_id().as_u32(),
                outcome = %outcome,
                "install finished"
            ),
            Err(err) => warn!(
                unit = artifact.unit().as_u64(),
                compile_id = artifact.compile_id().as_u32(),
                error = %err,
                "install failed"
            ),
        }
        result
    }
}

impl std::fmt::Debug for InstallChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallChannel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
