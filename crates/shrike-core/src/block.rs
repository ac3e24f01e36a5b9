//! Blockwise transfer state (RFC 7959).
//!
//! The client-side loops live in the request driver
//! ([`crate::context`]); this module holds the pure pieces: payload
//! slicing, upload reassembly with gap detection, and download
//! accumulation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use shrike_msg::BlockValue;
use shrike_transport::RemoteEndpoint;

use crate::error::Error;

/// Reassembly state is dropped after this long without a new block.
pub(crate) const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Slice `payload` for block `num` at size `2^(szx+4)`.
/// Returns the chunk and whether more blocks follow.
pub(crate) fn chunk(payload: &[u8], num: u32, szx: u8) -> Option<(&[u8], bool)> {
    let size = 1usize << (szx + 4);
    let start = num as usize * size;
    if start >= payload.len() {
        return None;
    }
    let end = (start + size).min(payload.len());
    Some((&payload[start..end], end < payload.len()))
}

/// Whether a payload needs Block1 treatment at the given exponent.
pub(crate) fn needs_block1(payload_len: usize, szx: u8) -> bool {
    payload_len > 1 << (szx + 4)
}

/// Client-side accumulation of a Block2 download.
#[derive(Debug, Default)]
pub(crate) struct Block2Assembly {
    data: Vec<u8>,
    next_num: u32,
}

impl Block2Assembly {
    /// Absorb one response block. Returns the next block number to
    /// request, or `None` when the transfer is complete.
    ///
    /// # Errors
    ///
    /// `UnexpectedBlock2` when the server answers a different block than
    /// requested.
    pub(crate) fn absorb(
        &mut self,
        block: &BlockValue,
        payload: &[u8],
    ) -> Result<Option<u32>, Error> {
        if block.num != self.next_num {
            return Err(Error::UnexpectedBlock2);
        }
        self.data.extend_from_slice(payload);
        self.next_num += 1;
        Ok(block.more.then_some(self.next_num))
    }

    /// The assembled representation.
    pub(crate) fn into_payload(self) -> Vec<u8> {
        self.data
    }
}

/// One Block1 upload being reassembled on the server.
#[derive(Debug)]
struct Block1Assembly {
    data: Vec<u8>,
    next_num: u32,
    updated: Instant,
}

/// What absorbing an upload block produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UploadProgress {
    /// Waiting for more blocks; answer 2.31 Continue.
    Continue,
    /// Upload complete; dispatch with this payload.
    Complete(Vec<u8>),
}

/// Server-side Block1 reassembly, keyed by (remote, path).
pub(crate) struct UploadTracker {
    assemblies: Mutex<HashMap<(RemoteEndpoint, Vec<String>), Block1Assembly>>,
}

impl UploadTracker {
    pub(crate) fn new() -> Self {
        UploadTracker {
            assemblies: Mutex::new(HashMap::new()),
        }
    }

    /// Absorb one Block1 upload block.
    ///
    /// # Errors
    ///
    /// `UnexpectedBlock1` on a number gap or on a continuation without a
    /// transfer in progress; the stale state is discarded so the client
    /// can start over.
    pub(crate) fn absorb(
        &self,
        remote: &RemoteEndpoint,
        path: &[String],
        block: &BlockValue,
        payload: &[u8],
    ) -> Result<UploadProgress, Error> {
        let key = (remote.clone(), path.to_vec());
        let mut assemblies = self.assemblies.lock().expect("upload tracker lock");
        assemblies.retain(|_, a| a.updated.elapsed() < ASSEMBLY_TIMEOUT);

        if block.num == 0 {
            // (Re)start; a fresh num 0 always replaces leftover state.
            assemblies.insert(
                key.clone(),
                Block1Assembly {
                    data: Vec::new(),
                    next_num: 0,
                    updated: Instant::now(),
                },
            );
        }

        let Some(assembly) = assemblies.get_mut(&key) else {
            return Err(Error::UnexpectedBlock1);
        };
        if block.num != assembly.next_num {
            assemblies.remove(&key);
            return Err(Error::UnexpectedBlock1);
        }

        assembly.data.extend_from_slice(payload);
        assembly.next_num += 1;
        assembly.updated = Instant::now();

        if block.more {
            Ok(UploadProgress::Continue)
        } else {
            let assembly = assemblies.remove(&key).expect("just inserted");
            Ok(UploadProgress::Complete(assembly.data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteEndpoint {
        RemoteEndpoint::from_socket_addr("udp", "192.0.2.1:5683".parse().unwrap())
    }

    fn path() -> Vec<String> {
        vec!["upload".to_string()]
    }

    fn block(num: u32, more: bool, szx: u8) -> BlockValue {
        BlockValue::new(num, more, szx).unwrap()
    }

    #[test]
    fn test_chunking() {
        let payload = vec![7u8; 100];
        // szx 2 = 64-byte blocks
        let (first, more) = chunk(&payload, 0, 2).unwrap();
        assert_eq!(first.len(), 64);
        assert!(more);

        let (second, more) = chunk(&payload, 1, 2).unwrap();
        assert_eq!(second.len(), 36);
        assert!(!more);

        assert!(chunk(&payload, 2, 2).is_none());
    }

    #[test]
    fn test_needs_block1() {
        assert!(!needs_block1(1024, 6));
        assert!(needs_block1(1025, 6));
        assert!(needs_block1(17, 0));
    }

    #[test]
    fn test_upload_reassembly() {
        let tracker = UploadTracker::new();
        let payload = (0..=255u8).cycle().take(200).collect::<Vec<u8>>();

        // 64-byte blocks: 0, 1, 2 then final 3
        let mut progress = UploadProgress::Continue;
        for num in 0..4u32 {
            let (data, more) = chunk(&payload, num, 2).unwrap();
            progress = tracker
                .absorb(&remote(), &path(), &block(num, more, 2), data)
                .unwrap();
        }
        assert_eq!(progress, UploadProgress::Complete(payload));
    }

    #[test]
    fn test_upload_gap_aborts() {
        let tracker = UploadTracker::new();
        tracker
            .absorb(&remote(), &path(), &block(0, true, 2), &[0u8; 64])
            .unwrap();

        // skipping block 1
        let result = tracker.absorb(&remote(), &path(), &block(2, true, 2), &[0u8; 64]);
        assert!(matches!(result, Err(Error::UnexpectedBlock1)));

        // state was discarded, continuation has nothing to resume
        let result = tracker.absorb(&remote(), &path(), &block(1, true, 2), &[0u8; 64]);
        assert!(matches!(result, Err(Error::UnexpectedBlock1)));

        // a restart at 0 is always welcome
        assert_eq!(
            tracker
                .absorb(&remote(), &path(), &block(0, false, 2), &[1, 2, 3])
                .unwrap(),
            UploadProgress::Complete(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_upload_without_start() {
        let tracker = UploadTracker::new();
        let result = tracker.absorb(&remote(), &path(), &block(1, true, 2), &[0u8; 64]);
        assert!(matches!(result, Err(Error::UnexpectedBlock1)));
    }

    #[test]
    fn test_concurrent_uploads_keyed_separately() {
        let tracker = UploadTracker::new();
        let other_path = vec!["other".to_string()];

        tracker
            .absorb(&remote(), &path(), &block(0, true, 2), &[0xAA; 64])
            .unwrap();
        tracker
            .absorb(&remote(), &other_path, &block(0, true, 2), &[0xBB; 64])
            .unwrap();

        let a = tracker
            .absorb(&remote(), &path(), &block(1, false, 2), &[0xAA; 10])
            .unwrap();
        let b = tracker
            .absorb(&remote(), &other_path, &block(1, false, 2), &[0xBB; 10])
            .unwrap();

        assert_eq!(a, UploadProgress::Complete(vec![0xAA; 74]));
        assert_eq!(b, UploadProgress::Complete(vec![0xBB; 74]));
    }

    #[test]
    fn test_block2_assembly() {
        let mut assembly = Block2Assembly::default();
        assert_eq!(
            assembly.absorb(&block(0, true, 2), &[1u8; 64]).unwrap(),
            Some(1)
        );
        assert_eq!(
            assembly.absorb(&block(1, true, 2), &[2u8; 64]).unwrap(),
            Some(2)
        );
        assert_eq!(assembly.absorb(&block(2, false, 2), &[3u8; 5]).unwrap(), None);

        let payload = assembly.into_payload();
        assert_eq!(payload.len(), 133);
    }

    #[test]
    fn test_block2_out_of_sequence() {
        let mut assembly = Block2Assembly::default();
        assembly.absorb(&block(0, true, 2), &[0u8; 64]).unwrap();
        assert!(matches!(
            assembly.absorb(&block(2, true, 2), &[0u8; 64]),
            Err(Error::UnexpectedBlock2)
        ));
    }
}
