// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Work path of the chain
//!
//! Once the chain is initialized it is driven from two contexts running concurrently:
//!   * `WorkTx` turns work into job frames and records them in the job registry
//!   * `WorkRx` receives result records and matches them against the job registry
//!
//! Both go through a `Transport` that moves raw bytes to and from the chain.

use crate::logging::macros::*;

use async_trait::async_trait;

use crate::bm1370::{self, AsicResult};
use crate::command;
use crate::error::{self, ErrorKind};
use crate::frame::Frame;
use crate::registry::JobRegistry;
use crate::work::WorkUnit;

use packed_struct::PackedStruct;
use std::sync::Arc;

/// Byte-level link to the chain (UART)
///
/// The driver doesn't retry, any failure is reported to the caller as is.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send all of `data`
    async fn send(&self, data: &[u8]) -> error::Result<()>;

    /// Fill all of `buffer` with data received from the chain
    ///
    /// Returns `ErrorKind::Timeout` when nothing arrives within the transport deadline.
    async fn receive(&self, buffer: &mut [u8]) -> error::Result<()>;
}

/// Nonce found by one of the chips, matched to the work it solves
#[derive(Debug, Clone)]
pub struct ChipResult {
    pub job_id: u8,
    /// Nonce as it appears in the block header
    pub nonce: u32,
    /// Version of the work with bits rolled by the chip
    pub rolled_version: u32,
    pub core_id: u8,
    pub small_core_id: u8,
    pub midstate_num: u8,
    pub work: Arc<WorkUnit>,
}

impl ChipResult {
    /// Parse one result record and match it against outstanding work
    ///
    /// Fails with `ErrorKind::StaleJob` when the record refers to a job id that is not valid.
    pub fn decode(raw: &[u8; AsicResult::SIZE], registry: &JobRegistry) -> error::Result<Self> {
        let record = AsicResult::unpack(raw)?;
        if record.preamble != u16::from_be_bytes(bm1370::RESPONSE_PREAMBLE) {
            Err(ErrorKind::Frame(format!(
                "bad result preamble {:#06x}",
                record.preamble
            )))?
        }

        let job_id = record.job_id();
        trace!(
            "Job ID: {:#04x}, Core: {}/{}, Ver: {:#010x}",
            job_id,
            record.core_id(),
            record.small_core_id(),
            record.version_bits()
        );
        if !registry.is_valid(job_id) {
            Err(ErrorKind::StaleJob(job_id))?
        }
        let work = match registry.take(job_id) {
            Some(work) => work,
            None => Err(ErrorKind::StaleJob(job_id))?,
        };

        Ok(Self {
            job_id,
            nonce: record.nonce.swap_bytes(),
            rolled_version: work.version | record.version_bits(),
            core_id: record.core_id(),
            small_core_id: record.small_core_id(),
            midstate_num: record.midstate_num,
            work,
        })
    }
}

/// Send context: dispatches work to the chain
pub struct WorkTx<T> {
    command_context: command::Context<T>,
    registry: Arc<JobRegistry>,
}

impl<T> Clone for WorkTx<T> {
    fn clone(&self) -> Self {
        Self {
            command_context: self.command_context.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<T: Transport> WorkTx<T> {
    pub fn new(command_context: command::Context<T>, registry: Arc<JobRegistry>) -> Self {
        Self {
            command_context,
            registry,
        }
    }

    /// Register `work` and send it to the chain
    ///
    /// Returns: job id the work has been sent under
    pub async fn send_work(&self, work: Arc<WorkUnit>) -> error::Result<u8> {
        let job_id = self.registry.submit(work.clone());
        let payload = bm1370::job_payload(job_id, &work);
        let frame = Frame::encode(bm1370::job_header(), &payload)?;

        trace!("Send job {:#04x}", job_id);
        if let Err(e) = self.command_context.send_frame(&frame).await {
            self.registry.invalidate(job_id);
            warn!("Job {:#04x} not sent: {}", job_id, e);
            return Err(e);
        }
        Ok(job_id)
    }

    /// Drop all outstanding work, results for it will be ignored
    pub fn invalidate_all(&self) {
        debug!("Invalidating all outstanding jobs");
        self.registry.invalidate_all();
    }
}

/// Receive context: collects results from the chain
pub struct WorkRx<T> {
    transport: Arc<T>,
    registry: Arc<JobRegistry>,
}

impl<T: Transport> WorkRx<T> {
    pub fn new(transport: Arc<T>, registry: Arc<JobRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    /// Wait for one result record from the chain
    ///
    /// Returns `None` when the transport fails or the result doesn't belong to outstanding
    /// work. Neither is fatal, the caller should just ask for the next result.
    pub async fn recv_result(&self) -> Option<ChipResult> {
        let mut raw = [0u8; AsicResult::SIZE];
        if let Err(e) = self.transport.receive(&mut raw).await {
            match e.kind() {
                ErrorKind::Timeout => trace!("No result: {}", e),
                _ => warn!("Receiving result failed: {}", e),
            }
            return None;
        }

        match ChipResult::decode(&raw, &self.registry) {
            Ok(result) => {
                debug!(
                    "Nonce {:#010x} for job {:#04x} (version {:#010x})",
                    result.nonce, result.job_id, result.rolled_version
                );
                Some(result)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::StaleJob(job_id) => {
                        warn!("Invalid job nonce found, job {:#04x}", job_id)
                    }
                    _ => warn!("Dropping result {}: {}", hex::encode(&raw[..]), e),
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::FakeChain;
    use crate::work;

    /// Result record: nonce 0x00000002 (core 1), reply id 0x31 (job 0x18, small core 1),
    /// version bits 0x0004
    const RESULT_RECORD: [u8; AsicResult::SIZE] = [
        0xaa, 0x55, 0x02, 0x00, 0x00, 0x00, 0x00, 0x31, 0x00, 0x04, 0x80,
    ];

    /// Registry with work (version 0x20000000) stored under job id 0x18
    fn registry_with_job_0x18() -> JobRegistry {
        let registry = JobRegistry::new();
        assert_eq!(registry.submit(Arc::new(work::test::prepare(0))), 0x00);
        assert_eq!(registry.submit(Arc::new(work::test::prepare(1))), 0x18);
        registry
    }

    #[test]
    fn test_decode_result() {
        let registry = registry_with_job_0x18();
        let result = ChipResult::decode(&RESULT_RECORD, &registry).expect("result is valid");

        assert_eq!(result.job_id, 0x18);
        assert_eq!(result.core_id, 1);
        assert_eq!(result.small_core_id, 1);
        assert_eq!(result.midstate_num, 0);
        assert_eq!(result.rolled_version, 0x2000_8000);
        assert_eq!(result.nonce, 0x0000_0002);
        assert_eq!(result.work.ntime, 1);
    }

    #[test]
    fn test_decode_stale_result() {
        let registry = JobRegistry::new();
        let error = ChipResult::decode(&RESULT_RECORD, &registry).expect_err("job was never sent");
        assert_eq!(error.kind(), ErrorKind::StaleJob(0x18));

        let registry = registry_with_job_0x18();
        registry.invalidate_all();
        let error = ChipResult::decode(&RESULT_RECORD, &registry).expect_err("job invalidated");
        assert_eq!(error.kind(), ErrorKind::StaleJob(0x18));
    }

    #[test]
    fn test_decode_garbage() {
        let registry = registry_with_job_0x18();
        let mut raw = RESULT_RECORD;
        raw[0] = 0x55;
        assert!(ChipResult::decode(&raw, &registry).is_err());
    }

    /// Job frame captured on a running miner
    const JOB_FRAME: [u8; 88] = [
        0x55, 0xaa, 0x21, 0x56, 0x18, 0x01, 0x00, 0x00, 0x00, 0x00, 0x38, 0xfa, 0x01, 0x17, 0xdc,
        0x17, 0xd6, 0x68, 0x15, 0x16, 0xab, 0x3d, 0x16, 0x42, 0xbb, 0x1f, 0xe2, 0xe2, 0x37, 0x7f,
        0x8a, 0xc5, 0x83, 0xe5, 0xda, 0x99, 0x6c, 0x6b, 0xc7, 0x05, 0x3e, 0xae, 0x56, 0x4b, 0x02,
        0x03, 0xcc, 0x4e, 0xd2, 0x37, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xa2, 0x5c,
        0x00, 0x00, 0xa1, 0xe7, 0xab, 0x5e, 0x5f, 0x24, 0x46, 0xa3, 0x5f, 0x9c, 0xbb, 0xea, 0x3f,
        0x53, 0x16, 0xe5, 0x4e, 0x39, 0x93, 0xde, 0x00, 0x00, 0x00, 0x20, 0x6b, 0x18,
    ];

    fn captured_work() -> WorkUnit {
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&JOB_FRAME[18..50]);
        let mut prev_block_hash = [0u8; 32];
        prev_block_hash.copy_from_slice(&JOB_FRAME[50..82]);
        WorkUnit::new(
            prev_block_hash,
            merkle_root,
            0x2000_0000,
            0x68d6_17dc,
            0x1701_fa38,
            0,
        )
    }

    #[tokio::test]
    async fn test_send_work() {
        let chain = Arc::new(FakeChain::new(1));
        let registry = Arc::new(JobRegistry::new());
        let tx = WorkTx::new(command::Context::new(chain.clone()), registry.clone());

        let work = Arc::new(captured_work());
        assert_eq!(tx.send_work(work.clone()).await.unwrap(), 0x00);
        assert_eq!(tx.send_work(work.clone()).await.unwrap(), 0x18);

        let sent = chain.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[1][..], &JOB_FRAME[..]);
        let frame = Frame::decode(&sent[0]).expect("valid job frame");
        assert_eq!(frame.payload()[0], 0x00);
        assert_eq!(frame.payload().len(), bm1370::JOB_PAYLOAD_SIZE);

        assert!(registry.is_valid(0x00));
        assert!(registry.is_valid(0x18));
        tx.invalidate_all();
        assert!(!registry.is_valid(0x18));
    }

    #[tokio::test]
    async fn test_send_work_failure() {
        let chain = Arc::new(FakeChain::new(1));
        chain.set_send_failure(true);
        let registry = Arc::new(JobRegistry::new());
        let tx = WorkTx::new(command::Context::new(chain.clone()), registry.clone());

        assert!(tx.send_work(Arc::new(captured_work())).await.is_err());
        assert!(!registry.is_valid(0x00));
    }

    #[tokio::test]
    async fn test_recv_result() {
        let chain = Arc::new(FakeChain::new(1));
        let registry = Arc::new(registry_with_job_0x18());
        let rx = WorkRx::new(chain.clone(), registry.clone());

        chain.push_reply(RESULT_RECORD.to_vec());
        let result = rx.recv_result().await.expect("result expected");
        assert_eq!(result.rolled_version, 0x2000_8000);

        // silence on the line
        assert!(rx.recv_result().await.is_none());

        // stale result is dropped
        registry.invalidate_all();
        chain.push_reply(RESULT_RECORD.to_vec());
        assert!(rx.recv_result().await.is_none());
    }

    /// Jobs are sent while results are being received
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_contexts() {
        let chain = Arc::new(FakeChain::new(1));
        let registry = Arc::new(JobRegistry::new());
        let tx = WorkTx::new(command::Context::new(chain.clone()), registry.clone());
        let rx = WorkRx::new(chain.clone(), registry.clone());

        let sender = tokio::spawn(async move {
            for i in 0..64 {
                tx.send_work(Arc::new(work::test::prepare(i)))
                    .await
                    .expect("send failed");
            }
        });
        let receiver = tokio::spawn(async move {
            for _ in 0..64 {
                chain.push_reply(RESULT_RECORD.to_vec());
                if let Some(result) = rx.recv_result().await {
                    assert_eq!(result.job_id, 0x18);
                    assert_eq!(result.rolled_version, 0x2000_8000);
                }
            }
        });
        sender.await.expect("sender panicked");
        receiver.await.expect("receiver panicked");
        assert_eq!(registry.take(0x18).map(|work| work.version), Some(0x2000_0000));
    }
}
