/*
 * Copyright (c) 2023-2025, Bib Labs Ltd.
 *
 * This file is part of the Bib Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@bib.dev
 * for more details.
*/

use super::Frame;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame layout: 4-byte big-endian length, then a version byte, then the
/// bincode payload. The version byte controls the payload schema and must
/// stay stable across releases.
#[derive(Default)]
pub struct RpcEncoder {}

pub const PROTOCOL_VERSION: u8 = 1;

const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

impl Decoder for RpcEncoder {
    type Item = Frame;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            // Not enough data to read the length marker.
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes(src[..LENGTH_PREFIX].try_into().unwrap()) as usize;

        if frame_len < 1 || frame_len > MAX_FRAME_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid frame length {}.", frame_len),
            ));
        } else if src.len() < LENGTH_PREFIX + frame_len {
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        let version = src[LENGTH_PREFIX];
        if version != PROTOCOL_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unsupported protocol version {}.", version),
            ));
        }

        let result = store::bincode::deserialize::<Frame>(
            &src[LENGTH_PREFIX + 1..LENGTH_PREFIX + frame_len],
        )
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to deserialize RPC frame: {}", e),
            )
        });
        src.advance(LENGTH_PREFIX + frame_len);

        Ok(Some(result?))
    }
}

impl Encoder<Frame> for RpcEncoder {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = store::bincode::serialize(&item).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to serialize RPC frame: {}", e),
            )
        })?;
        if bytes.len() + 1 > MAX_FRAME_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "RPC frame too large.",
            ));
        }

        dst.reserve(LENGTH_PREFIX + 1 + bytes.len());
        dst.extend_from_slice(&((bytes.len() + 1) as u32).to_be_bytes());
        dst.extend_from_slice(&[PROTOCOL_VERSION]);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::rpc::{Request, Response};
    use store::log::raft::RaftId;

    #[test]
    fn frame_round_trip() {
        let mut codec = RpcEncoder::default();
        let mut buf = BytesMut::new();

        codec
            .encode(
                Frame::Request(Request::Vote {
                    term: 7,
                    last: RaftId::new(6, 41),
                }),
                &mut buf,
            )
            .unwrap();

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Request(Request::Vote { term, last })) => {
                assert_eq!(term, 7);
                assert_eq!(last, RaftId::new(6, 41));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = RpcEncoder::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Response(Response::Pong), &mut buf)
            .unwrap();

        let mut partial = BytesMut::from(&buf[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn version_mismatch_is_an_error() {
        let mut codec = RpcEncoder::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Response(Response::Pong), &mut buf)
            .unwrap();
        buf[4] = PROTOCOL_VERSION + 1;

        assert!(codec.decode(&mut buf).is_err());
    }
}
