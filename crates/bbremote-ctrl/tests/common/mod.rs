#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bbremote_ctrl::{
    route, Controller, ControllerConfig, FsReply, FsRequest, GpioDirection, Message, Packet,
};
use bytes::Bytes;
use parking_lot::Mutex;
use ratp_conn::{Connection, ConnectionConfig, Event};
use ratp_frame::{Action, Direction, Frame, LinkTap};

pub const WAIT: Duration = Duration::from_secs(3);
pub const MEMORY_SIZE: usize = 256;

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        retransmit_timeout: Duration::from_millis(100),
        max_retransmits: 6,
        connect_timeout: Duration::from_secs(3),
        close_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        ..ConnectionConfig::default()
    }
}

pub fn controller_config() -> ControllerConfig {
    ControllerConfig {
        connection: fast_config(),
        reply_timeout: Some(WAIT),
        ping_timeout: Duration::from_millis(500),
        ..ControllerConfig::default()
    }
}

/// What the scripted agent has seen and holds.
pub struct AgentState {
    /// Message kinds in arrival order, e.g. `console:ls\n` or `getenv:bootargs`.
    pub log: Vec<String>,
    pub console: Vec<u8>,
    pub resets: Vec<bool>,
    pub memory: Vec<u8>,
    pub i2c: HashMap<(u8, u8, u16), u8>,
    pub gpio: HashMap<u32, (GpioDirection, u8)>,
    pub answer_pings: bool,
    /// Hold each pong back this long before sending it.
    pub pong_delay: Option<Duration>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            console: Vec::new(),
            resets: Vec::new(),
            memory: (0..MEMORY_SIZE).map(|i| i as u8).collect(),
            i2c: HashMap::new(),
            gpio: HashMap::new(),
            answer_pings: true,
            pong_delay: None,
        }
    }
}

/// A passive peer that behaves like a small bootloader agent.
pub struct Agent {
    pub conn: Arc<Connection>,
    pub state: Arc<Mutex<AgentState>>,
    thread: Option<JoinHandle<()>>,
}

impl Agent {
    pub fn spawn(stream: UnixStream, config: ConnectionConfig) -> Self {
        let conn = Arc::new(Connection::listen(stream, config, route).unwrap());
        let state = Arc::new(Mutex::new(AgentState::default()));
        let thread = {
            let conn = Arc::clone(&conn);
            let state = Arc::clone(&state);
            std::thread::spawn(move || loop {
                match conn.wait(Some(Duration::from_millis(50))) {
                    Ok(Some(Event::Data(payload))) => serve(&conn, &state, &payload),
                    Ok(_) => {}
                    Err(_) => return,
                }
            })
        };
        Self {
            conn,
            state,
            thread: Some(thread),
        }
    }

    /// Issue a file request to the host and wait for its answer.
    pub fn fs(&self, request: FsRequest) -> FsReply {
        let packet = Packet::request(Message::Fs(request)).encode().unwrap();
        let reply = self.conn.request(packet, Some(WAIT)).unwrap();
        match Packet::decode(&reply).unwrap().message {
            Message::FsReturn(reply) => reply,
            other => panic!("unexpected fs answer {other:?}"),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        let _ = self.conn.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(conn: &Connection, state: &Mutex<AgentState>, payload: &[u8]) {
    let packet = Packet::decode(payload).unwrap();
    let flags = packet.flags;
    let mut state = state.lock();

    let reply = match packet.message {
        Message::Command { command } => {
            state.log.push(format!("command:{command}"));
            let status = if command == "false" {
                1
            } else if let Some(text) = command.strip_prefix("echo ") {
                let line = Bytes::from(format!("{text}\n"));
                notify(conn, Message::ConsoleMsg { data: line });
                0
            } else {
                0
            };
            Some(Message::CommandReturn { status })
        }
        Message::ConsoleMsg { data } => {
            state.log.push(format!("console:{}", String::from_utf8_lossy(&data)));
            state.console.extend_from_slice(&data);
            None
        }
        Message::Getenv { name } => {
            state.log.push(format!("getenv:{name}"));
            let value = (name == "bootargs").then(|| Bytes::from_static(b"console=ttyS0"));
            Some(Message::GetenvReturn { value })
        }
        Message::Md { address, size, .. } => {
            let range = address as usize..(address as usize).saturating_add(size as usize);
            Some(match state.memory.get(range) {
                Some(data) => Message::MdReturn {
                    status: 0,
                    data: Bytes::copy_from_slice(data),
                },
                None => Message::MdReturn {
                    status: -22,
                    data: Bytes::new(),
                },
            })
        }
        Message::Mw { address, data, .. } => {
            let start = address as usize;
            Some(match state.memory.get_mut(start..start.saturating_add(data.len())) {
                Some(slot) => {
                    slot.copy_from_slice(&data);
                    Message::MwReturn {
                        status: 0,
                        written: data.len() as u32,
                    }
                }
                None => Message::MwReturn {
                    status: -22,
                    written: 0,
                },
            })
        }
        Message::I2cRead {
            bus,
            address,
            reg,
            size,
            ..
        } => {
            let data: Vec<u8> = (0..size)
                .map(|i| {
                    let reg = reg.wrapping_add(i);
                    state.i2c.get(&(bus, address, reg)).copied().unwrap_or(0xff)
                })
                .collect();
            Some(Message::I2cReadReturn {
                status: 0,
                data: Bytes::from(data),
            })
        }
        Message::I2cWrite {
            bus,
            address,
            reg,
            data,
            ..
        } => {
            for (i, byte) in data.iter().enumerate() {
                state
                    .i2c
                    .insert((bus, address, reg.wrapping_add(i as u16)), *byte);
            }
            Some(Message::I2cWriteReturn {
                status: 0,
                written: data.len() as u16,
            })
        }
        Message::GpioGetValue { gpio } => Some(Message::GpioGetValueReturn {
            value: state.gpio.get(&gpio).map_or(0, |(_, value)| *value),
        }),
        Message::GpioSetValue { gpio, value } => {
            let entry = state.gpio.entry(gpio).or_insert((GpioDirection::Input, 0));
            entry.1 = value;
            Some(Message::GpioSetValueReturn)
        }
        Message::GpioSetDirection {
            gpio,
            direction,
            value,
        } => {
            let status = if gpio >= 512 {
                -22
            } else {
                state.gpio.insert(gpio, (direction, value));
                0
            };
            Some(Message::GpioSetDirectionReturn { status })
        }
        Message::Ping => {
            if let Some(delay) = state.pong_delay {
                std::thread::sleep(delay);
            }
            state.answer_pings.then_some(Message::Pong)
        }
        Message::Reset { force } => {
            state.resets.push(force);
            None
        }
        _ => None,
    };

    if let Some(message) = reply {
        let bytes = Packet::reply(flags, message).encode().unwrap();
        let _ = conn.send_async(bytes);
    }
}

fn notify(conn: &Connection, message: Message) {
    let _ = conn.send_async(Packet::notify(message).encode().unwrap());
}

/// A controller talking to a scripted agent through a tap.
///
/// Fields drop in order: the controller closes first, then the agent.
pub struct Session {
    pub controller: Controller,
    pub agent: Agent,
    pub tap: LinkTap,
}

pub fn session<P>(policy: P) -> Session
where
    P: FnMut(Direction, &Frame) -> Action + Send + 'static,
{
    let (host_end, tap_left) = UnixStream::pair().unwrap();
    let (tap_right, agent_end) = UnixStream::pair().unwrap();
    let tap = LinkTap::spawn(tap_left, tap_right, policy).unwrap();

    let agent = Agent::spawn(agent_end, fast_config());
    let controller = Controller::connect(host_end, controller_config()).unwrap();
    agent.conn.wait_established(Some(WAIT)).unwrap();

    Session {
        controller,
        agent,
        tap,
    }
}

pub fn clean_session() -> Session {
    session(|_, _| Action::Forward)
}
