use byteorder::{ByteOrder, LittleEndian};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::Error::{self, *};
use crate::runtime::{
    context::InvocationId,
    ids::{LogicalThreadId, RequestId},
    sim::SimMessage,
};

/// Bytes taken by the length prefix in front of every frame.
pub const PREFIX_LEN: usize = 4;

/// The unit exchanged between processes. The thread id picks the logical
/// thread on the receiving side that the body is delivered to. Responses and
/// errors carry the request id of the request they answer.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Envelope {
    pub thread_id: LogicalThreadId,
    pub request_id: RequestId,
    pub body: Body,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum Body {
    Request(Message),
    Response(Message),
    /// A failed request, with a human readable reason.
    Error(String),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Request(_) => "request",
            Body::Response(_) => "response",
            Body::Error(_) => "error",
        }
    }
}

impl Envelope {
    pub fn request(
        thread_id: LogicalThreadId,
        request_id: RequestId,
        message: Message,
    ) -> Self {
        Self {
            thread_id,
            request_id,
            body: Body::Request(message),
        }
    }

    pub fn response(
        thread_id: LogicalThreadId,
        request_id: RequestId,
        message: Message,
    ) -> Self {
        Self {
            thread_id,
            request_id,
            body: Body::Response(message),
        }
    }

    pub fn error(
        thread_id: LogicalThreadId,
        request_id: RequestId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            thread_id,
            request_id,
            body: Body::Error(reason.into()),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, Body::Request(_))
    }
}

/// Every operation a process understands. Requests and their responses are
/// separate variants so a handler can match on exactly what it was sent.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum Message {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Status,
    StatusReport {
        process: String,
        threads: Vec<LogicalThreadId>,
    },
    Sim(SimMessage),
    SimAck(SimMessage),
    Invoke {
        invocation: InvocationId,
        args: Vec<u8>,
    },
    Invoked { result: Vec<u8> },
}

impl Message {
    /// Stable operation tag.
    pub fn tag(&self) -> u32 {
        match self {
            Message::Ping { .. } => 1,
            Message::Pong { .. } => 2,
            Message::Status => 3,
            Message::StatusReport { .. } => 4,
            Message::Sim(_) => 16,
            Message::SimAck(_) => 17,
            Message::Invoke { .. } => 32,
            Message::Invoked { .. } => 33,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Status => "status",
            Message::StatusReport { .. } => "status_report",
            Message::Sim(_) => "sim",
            Message::SimAck(_) => "sim_ack",
            Message::Invoke { .. } => "invoke",
            Message::Invoked { .. } => "invoked",
        }
    }
}

/// Serializes an envelope into a `len | archive` frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    let archive = rkyv::to_bytes::<_, 256>(envelope)
        .map_err(|_| CouldNotEncodeMessage)?;
    let len = u32::try_from(archive.len()).map_err(|_| {
        MessageLengthOverflowed {
            len: archive.len() as u64,
            max: u32::MAX,
        }
    })?;
    let mut frame = vec![0; PREFIX_LEN];
    LittleEndian::write_u32(&mut frame, len);
    frame.extend_from_slice(&archive);
    Ok(frame)
}

/// Deserializes an archive with the length prefix already stripped.
pub fn decode(archive: &[u8]) -> Result<Envelope, Error> {
    rkyv::from_bytes::<Envelope>(archive).map_err(|_| CouldNotDecodeMessage)
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads one frame. Running out of bytes part way through surfaces as an
/// `UnexpectedEof` io error, the same as a clean close between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Envelope, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0; PREFIX_LEN];
    reader.read_exact(&mut len_buf).await?;
    let len = LittleEndian::read_u32(&len_buf);
    if len > max_len {
        Err(MessageLengthOverflowed {
            len: len as u64,
            max: max_len,
        })?
    }
    // archives have to be read back from aligned memory
    let mut archive = AlignedVec::with_capacity(len as usize);
    archive.resize(len as usize, 0);
    reader.read_exact(&mut archive[..]).await?;
    decode(&archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ids::Mpo, sim::SimMessage};

    #[test]
    fn frame_starts_with_little_endian_length() {
        let envelope =
            Envelope::error(LogicalThreadId::new(), RequestId::next(), "boom");
        let frame = encode(&envelope).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - PREFIX_LEN);
        assert_eq!(decode(&frame[PREFIX_LEN..]).unwrap(), envelope);
    }

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let id = LogicalThreadId::new();
        let sent = vec![
            Envelope::request(
                id,
                RequestId(1),
                Message::Sim(SimMessage::Read(Mpo::new(1, 2, 3))),
            ),
            Envelope::response(
                id,
                RequestId(1),
                Message::StatusReport {
                    process: "daemon".into(),
                    threads: vec![id],
                },
            ),
        ];
        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                for envelope in &sent {
                    write_frame(&mut a, envelope).await.unwrap();
                }
            })
        };
        for expected in &sent {
            assert_eq!(&read_frame(&mut b, 1024).await.unwrap(), expected);
        }
        writer.await.unwrap();
        let closed = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(closed.is_expected_close());
    }

    #[tokio::test]
    async fn oversized_frames_are_a_hard_failure() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1_000_000u32.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, MessageLengthOverflowed { .. }));
        assert!(!err.is_expected_close());
    }

    #[test]
    fn garbage_does_not_decode() {
        let garbage = AlignedVec::new();
        assert!(matches!(decode(&garbage), Err(CouldNotDecodeMessage)));
    }
}
