//! The `<SenderCompID>-seqNums.json` checkpoint file.
//!
//! Both [`store::Store`](super::store::Store) and [`vec_store::Store`](super::vec_store::Store)
//! keep their own notion of durable sequence state (a SQL table or, for the ephemeral backend,
//! nothing at all), but operators and external tooling expect the plain sequence-number record
//! described for the session regardless of which backend is linked in. This module is that
//! record: written atomically (temp file + rename) after every successful outbound send and
//! every accepted inbound message.

use serde::Serialize;
use std::io;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Serialize)]
struct SeqNums {
    #[serde(rename = "outboundSeqNo")]
    outbound_seq_no: u32,
    #[serde(rename = "nextExpectedSeqNo")]
    next_expected_seq_no: u32,
}

/// Writes `<log_dir>/<sender_comp_id>-seqNums.json` via write-temp + rename so a reader never
/// observes a partially written file.
pub(super) async fn write(
    log_dir: &Path,
    sender_comp_id: &str,
    outbound_seq_no: u32,
    next_expected_seq_no: u32,
) -> io::Result<()> {
    let body = serde_json::to_vec(&SeqNums {
        outbound_seq_no,
        next_expected_seq_no,
    })
    .expect("seqNums checkpoint always serializes");

    let final_path = log_dir.join(format!("{sender_comp_id}-seqNums.json"));
    let tmp_path = log_dir.join(format!("{sender_comp_id}-seqNums.json.tmp"));

    let mut tmp_file = fs::File::create(&tmp_path).await?;
    tmp_file.write_all(&body).await?;
    tmp_file.sync_all().await?;
    fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn writes_expected_json_shape() {
        let dir = tempfile_dir();
        write(&dir, "SENDER", 5, 9).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.join("SENDER-seqNums.json"))
            .await
            .unwrap();
        assert_eq!(contents, r#"{"outboundSeqNo":5,"nextExpectedSeqNo":9}"#);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn overwrites_previous_checkpoint_atomically() {
        let dir = tempfile_dir();
        write(&dir, "SENDER", 1, 1).await.unwrap();
        write(&dir, "SENDER", 2, 3).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.join("SENDER-seqNums.json"))
            .await
            .unwrap();
        assert_eq!(contents, r#"{"outboundSeqNo":2,"nextExpectedSeqNo":3}"#);
        assert!(!dir.join("SENDER-seqNums.json.tmp").exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    fn tempfile_dir() -> std::path::PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "fixcore-checkpoint-test-{}-{}",
            std::process::id(),
            n
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
