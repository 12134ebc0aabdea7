use crate::core::{NodeKey, TaskError};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::TryFrom;

/// What a [`Packet`] asks its receiver to do.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
  /// Periodic liveness and status report.
  Heartbeat = 1,
  /// Run a task. Carries a task envelope.
  Exec,
  /// The answer to an [`Exec`](Opcode::Exec).
  Ack,
  /// Acknowledges an [`Ack`](Opcode::Ack), letting the receiver drop the answer.
  AckAck,
  /// Asks the receiver to cancel a running task.
  Cancel,
  /// A leader proposes a new membership.
  Propose,
  /// A member accepts a proposed membership.
  Accept,
  /// A leader commits an accepted membership.
  Commit,
}

/*
The header is hand-encoded rather than going through serde: the receiver must know exactly how
many bytes it occupies to find where the payload starts, and TCP readers need the payload length
before they can read the rest of the frame.
 */
/// The fixed-size prefix of every [`Packet`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
  pub opcode: Opcode,
  pub sender: NodeKey,
  pub task: u32,
  pub len: u32,
}
// Serialization is big endian
impl PacketHeader {
  pub const SIZE: usize = 15;
  /// The largest payload a reader will allocate for.
  pub const MAX_PAYLOAD: u32 = 64 << 20;

  pub fn is_oversized(&self) -> bool {
    self.len > Self::MAX_PAYLOAD
  }

  pub fn put(&self, buf: &mut [u8]) {
    if buf.len() != Self::SIZE {
      panic!("Packet header ser buf: {}, expected {}", buf.len(), Self::SIZE);
    }
    buf[0] = self.opcode.into();
    buf[1..7].copy_from_slice(&self.sender.to_bytes()[..]);
    buf[7..11].copy_from_slice(&self.task.to_be_bytes()[..]);
    buf[11..15].copy_from_slice(&self.len.to_be_bytes()[..]);
  }
}
impl TryFrom<&[u8]> for PacketHeader {
  type Error = TaskError;

  fn try_from(buf: &[u8]) -> Result<Self, TaskError> {
    if buf.len() < Self::SIZE {
      return Err(TaskError::Codec(format!(
        "packet header: {} bytes, expected {}",
        buf.len(),
        Self::SIZE
      )));
    }
    let opcode = Opcode::try_from(buf[0])
      .map_err(|_| TaskError::Codec(format!("unknown opcode {}", buf[0])))?;
    Ok(PacketHeader {
      opcode: opcode,
      sender: NodeKey::from_bytes(&buf[1..7]),
      task: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
      len: u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]),
    })
  }
}

/// A header and its payload, encoded as one contiguous buffer.
#[derive(Clone, Debug)]
pub struct Packet {
  bytes: Vec<u8>,
}
impl Packet {
  pub fn new(opcode: Opcode, sender: NodeKey, task: u32, payload: &[u8]) -> Packet {
    let header = PacketHeader {
      opcode: opcode,
      sender: sender,
      task: task,
      len: payload.len() as u32,
    };
    let mut bytes = vec![0u8; PacketHeader::SIZE + payload.len()];
    header.put(&mut bytes[..PacketHeader::SIZE]);
    bytes[PacketHeader::SIZE..].copy_from_slice(payload);
    Packet { bytes: bytes }
  }

  /// Splits a received buffer into its header and payload. Fails if the buffer is shorter than
  /// the header says it should be.
  pub fn parse(buf: &[u8]) -> Result<(PacketHeader, &[u8]), TaskError> {
    let header = PacketHeader::try_from(buf)?;
    let end = PacketHeader::SIZE + header.len as usize;
    if buf.len() < end {
      return Err(TaskError::Codec(format!(
        "{:?} packet truncated: {} of {} bytes",
        header.opcode,
        buf.len(),
        end
      )));
    }
    Ok((header, &buf[PacketHeader::SIZE..end]))
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes[..]
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }
}

pub(crate) fn serialize<T: Serialize>(item: &T) -> Result<Vec<u8>, TaskError> {
  serde_cbor::to_vec(item).map_err(TaskError::from)
}

pub(crate) fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TaskError> {
  serde_cbor::from_slice(bytes).map_err(TaskError::from)
}

#[test]
fn test_packet_header_serde() {
  let header = PacketHeader {
    opcode: Opcode::AckAck,
    sender: NodeKey::new(std::net::Ipv4Addr::new(0xc0, 0xa8, 0x8b, 0x5d), 0xea01),
    task: 0x8b5d7015,
    len: 0x0f0e0d0c,
  };
  let mut buf = [0u8; PacketHeader::SIZE];
  header.put(&mut buf);
  assert_eq!(buf[0], 4);
  assert_eq!(&buf[1..7], &[0xc0, 0xa8, 0x8b, 0x5d, 0xea, 0x01]);
  assert_eq!(header, PacketHeader::try_from(&buf[..]).unwrap());
  assert!(header.is_oversized());
  let small = PacketHeader {
    len: PacketHeader::MAX_PAYLOAD,
    ..header
  };
  assert!(!small.is_oversized());
}

#[test]
fn test_packet_parse() {
  let sender = NodeKey::new(std::net::Ipv4Addr::LOCALHOST, 5001);
  let packet = Packet::new(Opcode::Exec, sender, 7, b"hello");
  let (header, payload) = Packet::parse(packet.bytes()).unwrap();
  assert_eq!(header.opcode, Opcode::Exec);
  assert_eq!(header.task, 7);
  assert_eq!(payload, b"hello");
  assert!(Packet::parse(&packet.bytes()[..PacketHeader::SIZE + 2]).is_err());
  let mut bad = packet.bytes().to_vec();
  bad[0] = 200;
  assert!(Packet::parse(&bad[..]).is_err());
}
