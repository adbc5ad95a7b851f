//! Decryption normalizer.
//!
//! Upload traffic routinely contains permission-encrypted PDFs (print/copy
//! restrictions with a blank user password). lopdf can parse their object
//! table but the content streams stay ciphered, so stamping them would
//! corrupt the output. `normalize` probes the bytes first and routes only
//! the encrypted ones through an external decrypt step.
//!
//! Policy: when the decrypt step itself fails the whole request fails with
//! [`PipelineError::DecryptFailure`]. Falling back to the original bytes
//! would silently watermark an undecryptable document.

use std::io::Write;

use async_trait::async_trait;
use lopdf::Document;
use tracing::debug;
use uuid::Uuid;

use crate::config::DecryptConfig;
use crate::error::PipelineError;

/// Capability interface for the external decrypt step.
///
/// The production implementation shells out to qpdf; tests substitute a
/// double returning canned bytes so pipeline tests never touch the
/// filesystem or an external binary.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Produce a decrypted copy of `input`.
    async fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, PipelineError>;
}

/// Decryptor backed by the `qpdf --decrypt` command-line tool.
pub struct QpdfDecryptor {
    config: DecryptConfig,
}

impl QpdfDecryptor {
    pub fn new(config: DecryptConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Decryptor for QpdfDecryptor {
    async fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        // Unique per invocation so concurrent requests never collide.
        // NamedTempFile deletes on drop, which covers every exit path
        // below including the timeout.
        let invocation = Uuid::new_v4();
        let mut input_file = tempfile::Builder::new()
            .prefix(&format!("tidemark-{invocation}-in-"))
            .suffix(".pdf")
            .tempfile()?;
        input_file.write_all(input)?;
        input_file.flush()?;

        let output_file = tempfile::Builder::new()
            .prefix(&format!("tidemark-{invocation}-out-"))
            .suffix(".pdf")
            .tempfile()?;

        let mut command = tokio::process::Command::new(&self.config.qpdf_path);
        command
            .arg("--decrypt")
            // Permission-only schemes open with a blank user password.
            .arg("--password=")
            .arg(input_file.path())
            .arg(output_file.path())
            // A timeout drops the status future; without this the child
            // would outlive the request and write to a deleted temp path.
            .kill_on_drop(true);

        debug!(invocation = %invocation, "running external decrypt");

        let status = tokio::time::timeout(self.config.timeout, command.status())
            .await
            .map_err(|_| PipelineError::DecryptTimeout {
                secs: self.config.timeout.as_secs(),
            })??;

        if !status.success() {
            return Err(PipelineError::DecryptFailure(format!(
                "qpdf exited with {status}"
            )));
        }

        let decrypted = tokio::fs::read(output_file.path()).await?;
        Ok(decrypted)
    }
}

/// Returns true when the bytes load as a document with no encryption
/// dictionary, i.e. they are safe to stamp as-is.
fn loads_unencrypted(raw: &[u8]) -> bool {
    match Document::load_mem(raw) {
        Ok(doc) => doc.trailer.get(b"Encrypt").is_err(),
        Err(_) => false,
    }
}

/// Yield bytes guaranteed to load without an encryption error.
///
/// Unencrypted input is returned unchanged, byte for byte, without
/// invoking the decryptor. Anything else goes through `decryptor`, and the
/// result is re-probed so a decrypt step that "succeeds" with unusable
/// output still fails the request.
pub async fn normalize(
    raw: Vec<u8>,
    decryptor: &dyn Decryptor,
) -> Result<Vec<u8>, PipelineError> {
    if loads_unencrypted(&raw) {
        return Ok(raw);
    }

    debug!("input rejected by direct load, invoking decrypt step");
    let decrypted = decryptor.decrypt(&raw).await?;

    if !loads_unencrypted(&decrypted) {
        return Err(PipelineError::DecryptFailure(
            "decrypted output still fails to load".to_string(),
        ));
    }
    Ok(decrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test double counting invocations and replaying canned bytes.
    pub(crate) struct CannedDecryptor {
        pub output: Result<Vec<u8>, String>,
        pub calls: AtomicUsize,
    }

    impl CannedDecryptor {
        pub fn ok(bytes: Vec<u8>) -> Self {
            Self {
                output: Ok(bytes),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(msg: &str) -> Self {
            Self {
                output: Err(msg.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Decryptor for CannedDecryptor {
        async fn decrypt(&self, _input: &[u8]) -> Result<Vec<u8>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.output {
                Ok(bytes) => Ok(bytes.clone()),
                Err(msg) => Err(PipelineError::DecryptFailure(msg.clone())),
            }
        }
    }

    fn minimal_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        doc.objects.insert(
            pages_id,
            lopdf::Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![lopdf::Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn unencrypted_input_passes_through_untouched() {
        let pdf = minimal_pdf();
        let double = CannedDecryptor::ok(b"should never be used".to_vec());

        let normalized = normalize(pdf.clone(), &double).await.unwrap();

        assert_eq!(normalized, pdf);
        assert_eq!(double.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unloadable_input_goes_through_decryptor() {
        let double = CannedDecryptor::ok(minimal_pdf());

        let normalized = normalize(b"not a pdf at all".to_vec(), &double)
            .await
            .unwrap();

        assert_eq!(double.calls.load(Ordering::SeqCst), 1);
        assert!(Document::load_mem(&normalized).is_ok());
    }

    #[tokio::test]
    async fn decrypt_failure_fails_the_request() {
        let double = CannedDecryptor::failing("no dice");

        let err = normalize(b"garbage".to_vec(), &double).await.unwrap_err();
        assert!(matches!(err, PipelineError::DecryptFailure(_)));
    }

    /// Running, in the "consuming a pid" sense: a reaped or zombie process
    /// no longer counts.
    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_external_process() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        // Stand-in decrypt binary that records its pid and stalls.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-decrypt.sh");
        let pid_file = dir.path().join("pid");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let decryptor = QpdfDecryptor::new(DecryptConfig {
            qpdf_path: script.display().to_string(),
            timeout: Duration::from_millis(300),
        });

        let err = decryptor.decrypt(b"whatever").await.unwrap_err();
        assert!(matches!(err, PipelineError::DecryptTimeout { .. }));

        // The kill lands asynchronously; poll briefly before judging.
        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        for _ in 0..20 {
            if !is_running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("decrypt process {pid} survived the timeout");
    }

    #[tokio::test]
    async fn unusable_decrypt_output_is_rejected() {
        // Decryptor "succeeds" but its output still does not load.
        let double = CannedDecryptor::ok(b"still garbage".to_vec());

        let err = normalize(b"garbage".to_vec(), &double).await.unwrap_err();
        assert!(matches!(err, PipelineError::DecryptFailure(_)));
        assert_eq!(double.calls.load(Ordering::SeqCst), 1);
    }
}
