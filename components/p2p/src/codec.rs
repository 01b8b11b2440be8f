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

use std::io;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const DISCOVERY_PROTO: StreamProtocol = StreamProtocol::new("/bib/discovery/1");
pub const SYNC_PROTO: StreamProtocol = StreamProtocol::new("/bib/sync/1");
pub const DATA_PROTO: StreamProtocol = StreamProtocol::new("/bib/data/1");
pub const JOBS_PROTO: StreamProtocol = StreamProtocol::new("/bib/jobs/1");

/// Wire format per message: `[4 bytes big-endian length][version byte]
/// [bincode payload]`. The protocol name and version negotiate through
/// multistream-select, the version byte pins the payload schema.
pub const WIRE_VERSION: u8 = 1;

const MAX_MSG_BYTES: usize = 48 * 1024 * 1024;

async fn write_framed<W, T>(io: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize,
{
    let payload = store::bincode::serialize(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if payload.len() + 1 > MAX_MSG_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too large",
        ));
    }
    io.write_all(&(payload.len() as u32 + 1).to_be_bytes())
        .await?;
    io.write_all(&[WIRE_VERSION]).await?;
    io.write_all(&payload).await?;
    io.close().await
}

async fn read_framed<R, T>(io: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MSG_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid frame length",
        ));
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    if payload[0] != WIRE_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported wire version {}", payload[0]),
        ));
    }
    store::bincode::deserialize(&payload[1..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Length-prefixed bincode codec shared by all four request/response
/// protocols.
pub struct BibCodec<Req, Resp> {
    _marker: PhantomData<(Req, Resp)>,
}

impl<Req, Resp> Default for BibCodec<Req, Resp> {
    fn default() -> Self {
        BibCodec {
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp> Clone for BibCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

#[async_trait]
impl<Req, Resp> request_response::Codec for BibCodec<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + Sync,
    Resp: Serialize + DeserializeOwned + Send + Sync,
{
    type Protocol = StreamProtocol;
    type Request = Req;
    type Response = Resp;

    async fn read_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<Req>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn read_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<Resp>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn write_request<T>(
        &mut self,
        _proto: &StreamProtocol,
        io: &mut T,
        req: Req,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _proto: &StreamProtocol,
        io: &mut T,
        resp: Resp,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataRequest, DataResponse};
    use futures::io::Cursor;

    #[tokio::test]
    async fn frame_round_trip() {
        let request = DataRequest {
            dataset_id: store::uuid::Uuid::new_v4(),
            wanted: vec![1, 2, 3],
            max_frames: 8,
        };

        let mut buf = Vec::new();
        write_framed(&mut buf, &request).await.unwrap();
        let decoded: DataRequest = read_framed(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn unknown_wire_version_is_rejected() {
        let response = DataResponse::Busy;
        let mut buf = Vec::new();
        write_framed(&mut buf, &response).await.unwrap();
        buf[4] = WIRE_VERSION + 1;

        let result: io::Result<DataResponse> = read_framed(&mut Cursor::new(buf)).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
