// Control-plane message shapes and byte-exact wire formats shared by the
// server and client binaries. Two independent TCP connections run per
// client, each announced by a single opening byte (`ConnKind`); the control
// connection then carries discrete `ControlMessage`s, never interleaved
// with raw frame bytes.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
    #[error("unknown connection identifier byte {0:#x}")]
    UnknownConnKind(u8),

    #[error("unknown control command byte {0:#x}")]
    UnknownCommand(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The first byte sent on every connection, identifying its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// `m` — control connection.
    Management,
    /// `c` — stream connection.
    Camera,
}

impl ConnKind {
    pub fn to_byte(self) -> u8 {
        match self {
            ConnKind::Management => b'm',
            ConnKind::Camera => b'c',
        }
    }

    pub fn from_byte(b: u8) -> Option<ConnKind> {
        match b {
            b'm' => Some(ConnKind::Management),
            b'c' => Some(ConnKind::Camera),
            _ => None,
        }
    }

    /// Reads and classifies the opening identifier byte. Returns
    /// `Err(ProtoError::UnknownConnKind)` for any other byte; the caller is
    /// expected to close the connection in that case.
    pub fn read_from<R: Read>(r: &mut R) -> Result<ConnKind, ProtoError> {
        let b = r.read_u8()?;
        ConnKind::from_byte(b).ok_or(ProtoError::UnknownConnKind(b))
    }

    pub fn write_to<W: Write>(self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.to_byte())
    }
}

/// A control-plane command, in either direction. See the module docs for the
/// wire grammar; every variant here round-trips through `encode`/`decode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// `gr` — client asks for the server's default resolution.
    GetResolution,
    /// `sr` H H — client informs the server of its custom resolution.
    SetResolution { height: u16, width: u16 },
    /// `sf` B — client informs the server of its frame rate.
    SetFps { fps: u8 },
    /// one-byte `0x01` — "start stream now" (request or acknowledgment).
    Start,
    /// one-byte `0x00` — "stop stream".
    Stop,
    /// one-byte `q` — "shut down client".
    Shutdown,
}

const TAG_START: u8 = 0x01;
const TAG_STOP: u8 = 0x00;
const TAG_SHUTDOWN: u8 = b'q';

impl ControlMessage {
    pub fn encode(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6);
        self.write_to(&mut buf).expect("writing to a Vec never fails");
        buf
    }

    pub fn write_to<W: Write>(self, w: &mut W) -> io::Result<()> {
        match self {
            ControlMessage::GetResolution => w.write_all(b"gr"),
            ControlMessage::SetResolution { height, width } => {
                w.write_all(b"sr")?;
                w.write_u16::<BigEndian>(height)?;
                w.write_u16::<BigEndian>(width)
            }
            ControlMessage::SetFps { fps } => {
                w.write_all(b"sf")?;
                w.write_u8(fps)
            }
            ControlMessage::Start => w.write_u8(TAG_START),
            ControlMessage::Stop => w.write_u8(TAG_STOP),
            ControlMessage::Shutdown => w.write_u8(TAG_SHUTDOWN),
        }
    }

    /// Reads one control message from `r`, blocking until the whole message
    /// (tag plus any payload) has arrived.
    pub fn read_from<R: Read>(r: &mut R) -> Result<ControlMessage, ProtoError> {
        let first = r.read_u8()?;
        match first {
            TAG_START => Ok(ControlMessage::Start),
            TAG_STOP => Ok(ControlMessage::Stop),
            TAG_SHUTDOWN => Ok(ControlMessage::Shutdown),
            b'g' => {
                expect_byte(r, b'r')?;
                Ok(ControlMessage::GetResolution)
            }
            b's' => match r.read_u8()? {
                b'r' => {
                    let height = r.read_u16::<BigEndian>()?;
                    let width = r.read_u16::<BigEndian>()?;
                    Ok(ControlMessage::SetResolution { height, width })
                }
                b'f' => {
                    let fps = r.read_u8()?;
                    Ok(ControlMessage::SetFps { fps })
                }
                other => Err(ProtoError::UnknownCommand(other)),
            },
            other => Err(ProtoError::UnknownCommand(other)),
        }
    }
}

fn expect_byte<R: Read>(r: &mut R, want: u8) -> Result<(), ProtoError> {
    let got = r.read_u8()?;
    if got != want {
        return Err(ProtoError::UnknownCommand(got));
    }
    Ok(())
}

/// The server's untagged reply to `GetResolution`: just `H H`, no command
/// byte, since the grammar table lists it as the payload of the reply, not a
/// message of its own.
pub fn write_resolution_reply<W: Write>(w: &mut W, height: u16, width: u16) -> io::Result<()> {
    w.write_u16::<BigEndian>(height)?;
    w.write_u16::<BigEndian>(width)
}

pub fn read_resolution_reply<R: Read>(r: &mut R) -> io::Result<(u16, u16)> {
    let height = r.read_u16::<BigEndian>()?;
    let width = r.read_u16::<BigEndian>()?;
    Ok((height, width))
}

/// Byte length of one raw BGR24 frame at the given resolution.
pub fn frame_len(height: u16, width: u16) -> usize {
    height as usize * width as usize * 3
}

/// Reads exactly `buf.len()` bytes from `r`, looping on short reads, but
/// bailing out early (returning `Ok(false)`) if `still_running` goes false
/// between reads. `Ok(true)` means the full frame arrived.
///
/// Mirrors the ingest writer's stream reader: it must not hang forever
/// reading from a peer that stopped sending mid-frame once the session is
/// torn down.
pub fn read_frame<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    mut still_running: impl FnMut() -> bool,
) -> Result<bool, ProtoError> {
    let mut filled = 0;
    while filled < buf.len() {
        if !still_running() {
            return Ok(false);
        }
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(ProtoError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof mid-frame",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtoError::Io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(msg: ControlMessage) {
        let encoded = msg.encode();
        let decoded = ControlMessage::read_from(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn control_messages_round_trip() {
        round_trip(ControlMessage::GetResolution);
        round_trip(ControlMessage::SetResolution {
            height: 480,
            width: 320,
        });
        round_trip(ControlMessage::SetFps { fps: 30 });
        round_trip(ControlMessage::Start);
        round_trip(ControlMessage::Stop);
        round_trip(ControlMessage::Shutdown);
    }

    #[test]
    fn conn_kind_round_trips() {
        let mut buf = Vec::new();
        ConnKind::Management.write_to(&mut buf).unwrap();
        ConnKind::Camera.write_to(&mut buf).unwrap();
        let mut c = Cursor::new(buf);
        assert_eq!(ConnKind::read_from(&mut c).unwrap(), ConnKind::Management);
        assert_eq!(ConnKind::read_from(&mut c).unwrap(), ConnKind::Camera);
    }

    #[test]
    fn unknown_conn_kind_is_rejected() {
        let mut c = Cursor::new(vec![b'x']);
        assert!(matches!(
            ConnKind::read_from(&mut c),
            Err(ProtoError::UnknownConnKind(b'x'))
        ));
    }

    #[test]
    fn resolution_reply_round_trips() {
        let mut buf = Vec::new();
        write_resolution_reply(&mut buf, 480, 640).unwrap();
        assert_eq!(
            read_resolution_reply(&mut Cursor::new(buf)).unwrap(),
            (480, 640)
        );
    }

    #[test]
    fn frame_len_is_height_times_width_times_three() {
        assert_eq!(frame_len(480, 320), 480 * 320 * 3);
    }

    #[test]
    fn read_frame_fills_buffer_across_short_reads() {
        struct Stuttering(Vec<u8>);
        impl Read for Stuttering {
            fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                let n = 1.min(out.len());
                out[..n].copy_from_slice(&self.0[..n]);
                self.0.drain(..n);
                Ok(n)
            }
        }
        let mut src = Stuttering(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 5];
        assert!(read_frame(&mut src, &mut buf, || true).unwrap());
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn read_frame_aborts_when_running_flag_drops() {
        let mut src = Cursor::new(vec![1, 2, 3]);
        let mut buf = [0u8; 3];
        let mut calls = 0;
        let still_running = || {
            calls += 1;
            calls < 2
        };
        assert!(!read_frame(&mut src, &mut buf, still_running).unwrap());
    }
}
