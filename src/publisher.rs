//! Publish/subscribe bridge between the simulation and the writer.
//!
//! The simulation pushes [`Payload`] frames onto a bounded channel; the
//! publisher drains it and serializes each frame onto a loopback TCP socket
//! as a string topic header followed by a bincode body, mirroring the
//! canonical per-iteration order (`timesteps`, `agents`, optionally
//! `virus`). The terminal `agent_info` frame ends the stream.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::writer::AgentSummary;

/// One topic-tagged publication frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Timestep(f64),
    Agents(Array2<i16>),
    Virus(Array3<i16>),
    AgentInfo(Vec<AgentSummary>),
}

impl Payload {
    pub fn topic(&self) -> &'static str {
        match self {
            Payload::Timestep(_) => "timesteps",
            Payload::Agents(_) => "agents",
            Payload::Virus(_) => "virus",
            Payload::AgentInfo(_) => "agent_info",
        }
    }
}

/// Write one frame: u32 topic length, topic bytes, u64 body length, body.
pub fn send_frame(writer: &mut impl Write, payload: &Payload) -> io::Result<()> {
    let topic = payload.topic();
    let body = match payload {
        Payload::Timestep(t) => bincode::serialize(t),
        Payload::Agents(a) => bincode::serialize(a),
        Payload::Virus(v) => bincode::serialize(v),
        Payload::AgentInfo(info) => bincode::serialize(info),
    }
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    writer.write_all(&(topic.len() as u32).to_le_bytes())?;
    writer.write_all(topic.as_bytes())?;
    writer.write_all(&(body.len() as u64).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one frame, dispatching the body decoder on the topic.
pub fn recv_frame(reader: &mut impl Read) -> io::Result<Payload> {
    let mut len4 = [0u8; 4];
    reader.read_exact(&mut len4)?;
    let mut topic = vec![0u8; u32::from_le_bytes(len4) as usize];
    reader.read_exact(&mut topic)?;
    let topic = String::from_utf8(topic)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut len8 = [0u8; 8];
    reader.read_exact(&mut len8)?;
    let mut body = vec![0u8; u64::from_le_bytes(len8) as usize];
    reader.read_exact(&mut body)?;

    let decode_err = |e: bincode::Error| io::Error::new(io::ErrorKind::InvalidData, e);
    match topic.as_str() {
        "timesteps" => Ok(Payload::Timestep(
            bincode::deserialize(&body).map_err(decode_err)?,
        )),
        "agents" => Ok(Payload::Agents(
            bincode::deserialize(&body).map_err(decode_err)?,
        )),
        "virus" => Ok(Payload::Virus(
            bincode::deserialize(&body).map_err(decode_err)?,
        )),
        "agent_info" => Ok(Payload::AgentInfo(
            bincode::deserialize(&body).map_err(decode_err)?,
        )),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown topic '{other}'"),
        )),
    }
}

/// Accept the single subscriber, polling so a termination signal can
/// unblock the wait.
fn accept(listener: &TcpListener, terminate: &AtomicBool) -> Result<TcpStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "subscriber connected");
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if terminate.load(Ordering::Relaxed) {
                    return Err(Error::worker("publisher", "terminated while waiting for a subscriber"));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drain the queue onto the socket until the terminal `agent_info` frame or
/// termination. Dropping the stream on exit is what unblocks the writer.
pub fn publish(
    queue: Receiver<Payload>,
    listener: TcpListener,
    terminate: Arc<AtomicBool>,
) -> Result<()> {
    let stream = accept(&listener, &terminate)?;
    let mut writer = io::BufWriter::new(stream);

    loop {
        if terminate.load(Ordering::Relaxed) {
            return Err(Error::worker("publisher", "terminated before agent_info frame"));
        }
        match queue.recv_timeout(Duration::from_millis(1)) {
            Ok(payload) => {
                let last = matches!(payload, Payload::AgentInfo(_));
                send_frame(&mut writer, &payload)
                    .map_err(|e| Error::worker("publisher", e))?;
                if last {
                    debug!("agent_info frame relayed, publisher closing");
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::worker("publisher", "simulation queue disconnected"));
            }
        }
    }
}

/// Connect to the publisher with a short retry window.
pub fn subscribe(port: u16) -> Result<TcpStream> {
    let mut last = None;
    for _ in 0..100 {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                last = Some(e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
    Err(Error::worker(
        "writer",
        format!("could not reach the publisher: {:?}", last),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip_through_the_wire_format() {
        let frames = vec![
            Payload::Timestep(1714546800.0),
            Payload::Agents(array![[1i16, 2, 0, 1], [3, 4, 0, 2]]),
            Payload::Virus(Array3::from_elem((2, 2, 1), 7i16)),
            Payload::AgentInfo(vec![AgentSummary {
                age: 41,
                sex: "F".to_string(),
                long_covid: false,
                prevention_index: 0.5,
                mask: "n95".to_string(),
                vax: "mrna".to_string(),
                infected: true,
                hospitalized: false,
                deceased: false,
                capacity: 2,
            }]),
        ];

        let mut wire = Vec::new();
        for frame in &frames {
            send_frame(&mut wire, frame).unwrap();
        }

        let mut cursor = Cursor::new(wire);
        for frame in &frames {
            let decoded = recv_frame(&mut cursor).unwrap();
            assert_eq!(decoded.topic(), frame.topic());
            match (frame, &decoded) {
                (Payload::Timestep(a), Payload::Timestep(b)) => assert_eq!(a, b),
                (Payload::Agents(a), Payload::Agents(b)) => assert_eq!(a, b),
                (Payload::Virus(a), Payload::Virus(b)) => assert_eq!(a, b),
                (Payload::AgentInfo(a), Payload::AgentInfo(b)) => {
                    assert_eq!(a.len(), b.len());
                    assert_eq!(a[0].sex, b[0].sex);
                    assert_eq!(a[0].capacity, b[0].capacity);
                }
                _ => panic!("topic mismatch"),
            }
        }
    }

    #[test]
    fn unknown_topics_are_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(7u32).to_le_bytes());
        wire.extend_from_slice(b"gossip!");
        wire.extend_from_slice(&(0u64).to_le_bytes());
        assert!(recv_frame(&mut Cursor::new(wire)).is_err());
    }
}
