//! Fixed-layout binary encoding.
//!
//! ```text
//! request: | u32 name_len | name | u32 args_len | (u8 index, i32 value)* |
//! reply:   | u8 1 | f32 value |
//!          | u8 2 | u32 msg_len | msg |
//! ```
//!
//! All integers and floats are big-endian.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Transport,
    error::{Error, ErrorKind, Result},
    transport::MAX_MSG_SIZE,
};

const TAG_OK: u8 = 1;
const TAG_ERR: u8 = 2;
const ARG_SIZE: usize = 1 + std::mem::size_of::<i32>();
const MAX_NAME_LEN: usize = 1024;
/// One pair per possible `u8` index.
const MAX_ARGS_LEN: usize = 256 * ARG_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest {
    pub method: String,
    /// `(index, value)` pairs in wire order.
    pub args: Vec<(u8, i32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinaryReply {
    Ok(f32),
    Err(String),
}

/// Maps argument indexes of one method to argument names.
#[derive(Debug, Clone, Copy)]
pub struct ArgSchema {
    pub method: &'static str,
    pub params: &'static [(u8, &'static str)],
}

pub const DIVIDE: ArgSchema = ArgSchema {
    method: "divide",
    params: &[(1, "num1"), (2, "num2")],
};

/// Builds a `divide` request. `num2` is left off the wire when `None`, in
/// which case the callee applies its default.
#[must_use]
pub fn divide_request(num1: i32, num2: Option<i32>) -> BinaryRequest {
    let mut args = vec![(1, num1)];
    if let Some(num2) = num2 {
        args.push((2, num2));
    }
    BinaryRequest {
        method: DIVIDE.method.to_string(),
        args,
    }
}

impl BinaryRequest {
    pub fn encode(&self) -> Result<Bytes> {
        if self.method.len() > MAX_NAME_LEN || self.args.len() * ARG_SIZE > MAX_ARGS_LEN {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("request for {} is too long", self.method),
            ));
        }
        let name_len = u32::try_from(self.method.len())?;
        let args_len = u32::try_from(self.args.len() * ARG_SIZE)?;

        let mut bytes = BytesMut::with_capacity(8 + self.method.len() + self.args.len() * ARG_SIZE);
        bytes.put_u32(name_len);
        bytes.put_slice(self.method.as_bytes());
        bytes.put_u32(args_len);
        for &(index, value) in &self.args {
            bytes.put_u8(index);
            bytes.put_i32(value);
        }
        Ok(bytes.freeze())
    }

    /// Reads one request. `Ok(None)` means the peer closed the stream before
    /// sending another request.
    pub async fn read_from<S>(transport: &mut Transport<S>) -> Result<Option<Self>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !transport.has_more().await? {
            return Ok(None);
        }

        let name_len = usize::try_from(transport.recv_exact(4).await?.get_u32())?;
        if name_len > MAX_NAME_LEN {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("method name is too long: {name_len}"),
            ));
        }
        let name = transport.recv_exact(name_len).await?;
        let method = String::from_utf8(name.to_vec())?;

        let args_len = usize::try_from(transport.recv_exact(4).await?.get_u32())?;
        if args_len > MAX_ARGS_LEN {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("args are too long: {args_len}"),
            ));
        }
        if args_len % ARG_SIZE != 0 {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("args length {args_len} is not a multiple of {ARG_SIZE}"),
            ));
        }
        let mut body = transport.recv_exact(args_len).await?;
        let mut args = Vec::with_capacity(args_len / ARG_SIZE);
        while body.has_remaining() {
            args.push((body.get_u8(), body.get_i32()));
        }

        Ok(Some(Self { method, args }))
    }
}

impl ArgSchema {
    /// Names the request's arguments. Absent indexes stay absent.
    pub fn name_args(&self, req: &BinaryRequest) -> Result<BTreeMap<String, i32>> {
        let mut named = BTreeMap::new();
        for &(index, value) in &req.args {
            let Some((_, name)) = self.params.iter().find(|(i, _)| *i == index) else {
                return Err(Error::new(
                    ErrorKind::ArgumentMismatch,
                    format!("{} has no argument with index {index}", self.method),
                ));
            };
            if named.insert((*name).to_string(), value).is_some() {
                return Err(Error::new(
                    ErrorKind::ArgumentMismatch,
                    format!("{} got argument {name} twice", self.method),
                ));
            }
        }
        Ok(named)
    }
}

impl BinaryReply {
    pub fn encode(&self) -> Result<Bytes> {
        let mut bytes = BytesMut::new();
        match self {
            BinaryReply::Ok(value) => {
                bytes.put_u8(TAG_OK);
                bytes.put_f32(*value);
            }
            BinaryReply::Err(msg) => {
                bytes.put_u8(TAG_ERR);
                bytes.put_u32(u32::try_from(msg.len())?);
                bytes.put_slice(msg.as_bytes());
            }
        }
        Ok(bytes.freeze())
    }

    pub async fn read_from<S>(transport: &mut Transport<S>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let tag = transport.recv_exact(1).await?.get_u8();
        match tag {
            TAG_OK => Ok(BinaryReply::Ok(transport.recv_exact(4).await?.get_f32())),
            TAG_ERR => {
                let len = usize::try_from(transport.recv_exact(4).await?.get_u32())?;
                if len >= MAX_MSG_SIZE {
                    return Err(Error::new(
                        ErrorKind::TcpParseMsgFailed,
                        format!("error message is too long: {len}"),
                    ));
                }
                let msg = transport.recv_exact(len).await?;
                Ok(BinaryReply::Err(String::from_utf8(msg.to_vec())?))
            }
            tag => Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("unknown reply tag: {tag}"),
            )),
        }
    }
}

/// Sends one request and reads its reply.
pub async fn call<S>(transport: &mut Transport<S>, req: &BinaryRequest) -> Result<BinaryReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send_all(&req.encode()?).await?;
    BinaryReply::read_from(transport).await
}

/// Serves binary requests on one connection until the peer closes it.
///
/// Requests for methods without a schema, or with arguments the schema
/// does not know, get an error reply and the connection stays open.
pub async fn serve_connection<S, F>(
    mut transport: Transport<S>,
    schemas: &[ArgSchema],
    handler: F,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str, &BTreeMap<String, i32>) -> BinaryReply,
{
    while let Some(req) = BinaryRequest::read_from(&mut transport).await? {
        let reply = match schemas.iter().find(|s| s.method == req.method) {
            None => BinaryReply::Err(format!("no such method: {}", req.method)),
            Some(schema) => match schema.name_args(&req) {
                Ok(args) => handler(&req.method, &args),
                Err(e) => BinaryReply::Err(e.msg),
            },
        };
        transport.send_all(&reply.encode()?).await?;
    }
    Ok(())
}
