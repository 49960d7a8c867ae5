//! TCP framing for Raft RPC messages.
//!
//! Length-prefixed framing: a 4-byte big-endian u32 length field
//! followed by a bincode payload. Bincode is considerably smaller and
//! faster to encode than JSON for the numeric-heavy Raft message types.

use std::io;

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::raft::TypeConfig;

/// Maximum Raft frame size (10 MB). Snapshots can be large, but
/// anything beyond this is almost certainly a bug or an attack, and a
/// single frame must not be able to force an arbitrary allocation.
pub const MAX_RAFT_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// An inbound Raft RPC message.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpc {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<u64>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// A Raft RPC response.
#[derive(Serialize, Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<u64>),
    Vote(VoteResponse<u64>),
    InstallSnapshot(InstallSnapshotResponse<u64>),
}

/// Writes a length-prefixed bincode frame to `w`.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = data.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    Ok(())
}

/// Reads a length-prefixed bincode frame from `r`, rejecting oversized
/// frames before allocating.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RAFT_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("raft frame size {len} exceeds limit {MAX_RAFT_FRAME_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::Vote;

    #[tokio::test]
    async fn vote_request_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let rpc = RaftRpc::Vote(VoteRequest {
            vote: Vote::new(3, 1),
            last_log_id: None,
        });
        write_frame(&mut client, &rpc).await.unwrap();

        let decoded: RaftRpc = read_frame(&mut server).await.unwrap();
        match decoded {
            RaftRpc::Vote(req) => assert_eq!(req.vote, Vote::new(3, 1)),
            _ => panic!("expected vote request"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let bogus_len = (MAX_RAFT_FRAME_SIZE as u32) + 1;
        client.write_all(&bogus_len.to_be_bytes()).await.unwrap();
        drop(client);

        let err = read_frame::<_, RaftRpc>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn sequential_frames_preserved() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        for term in 1..=3u64 {
            let rpc = RaftRpcResponse::Vote(VoteResponse {
                vote: Vote::new(term, 1),
                vote_granted: term % 2 == 1,
                last_log_id: None,
            });
            write_frame(&mut client, &rpc).await.unwrap();
        }

        for term in 1..=3u64 {
            let decoded: RaftRpcResponse = read_frame(&mut server).await.unwrap();
            match decoded {
                RaftRpcResponse::Vote(resp) => {
                    assert_eq!(resp.vote, Vote::new(term, 1));
                    assert_eq!(resp.vote_granted, term % 2 == 1);
                }
                _ => panic!("expected vote response"),
            }
        }
    }
}
