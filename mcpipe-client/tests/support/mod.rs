//! In-process memcached binary-protocol server for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mcpipe_common::{OpCode, Status, HEADER_LENGTH, RESPONSE_MAGIC};

#[derive(Clone)]
struct Entry {
    flags: u32,
    value: Vec<u8>,
    cas: u64,
}

#[derive(Default)]
struct Store {
    items: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
}

impl Store {
    fn bump(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

struct Request {
    opcode: u8,
    opaque: u32,
    cas: u64,
    extra: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

struct Reply {
    status: Status,
    cas: u64,
    extra: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Reply {
    fn status(status: Status) -> Self {
        Reply {
            status,
            cas: 0,
            extra: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    fn ok() -> Self {
        Self::status(Status::NoError)
    }
}

pub struct MockServer {
    addr: SocketAddr,
    store: Arc<Mutex<Store>>,
    stop: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::bind("127.0.0.1:0".parse().unwrap(), Arc::default())
    }

    /// Restarts a stopped server on the same port with its old contents.
    pub fn restart(&mut self) {
        self.stop();
        let restarted = Self::bind(self.addr, self.store.clone());
        *self = restarted;
    }

    fn bind(addr: SocketAddr, store: Arc<Mutex<Store>>) -> Self {
        let listener = TcpListener::bind(addr).expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("addr");

        let stop = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let (store, stop, accepted, connections) =
                (store.clone(), stop.clone(), accepted.clone(), connections.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            stream.set_nonblocking(false).expect("blocking");
                            accepted.fetch_add(1, Ordering::SeqCst);
                            connections.lock().unwrap().push(stream.try_clone().expect("clone"));
                            let store = store.clone();
                            thread::spawn(move || {
                                let _ = serve(stream, store);
                            });
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        MockServer {
            addr,
            store,
            stop,
            accepted,
            connections,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Connections accepted since this server (re)started.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn item_count(&self) -> usize {
        self.store.lock().unwrap().items.len()
    }

    /// Closes the listener and every open connection.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for stream in self.connections.lock().unwrap().drain(..) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An address nothing listens on.
pub fn closed_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr.to_string()
}

fn serve(mut stream: TcpStream, store: Arc<Mutex<Store>>) -> io::Result<()> {
    loop {
        let request = read_request(&mut stream)?;
        let opcode = OpCode::from_u8(request.opcode);
        let quiet = opcode.is_some_and(OpCode::is_quiet);

        let replies = match opcode {
            Some(opcode) => handle(&store, loud(opcode), &request),
            None => vec![Reply::status(Status::UnknownCommand)],
        };
        for reply in replies {
            if quiet && reply.status == Status::NoError {
                continue;
            }
            if quiet && reply.status == Status::KeyNotFound && is_get(request.opcode) {
                continue;
            }
            write_reply(&mut stream, &request, reply)?;
        }
    }
}

fn is_get(opcode: u8) -> bool {
    matches!(
        OpCode::from_u8(opcode),
        Some(OpCode::GetQ | OpCode::GetKQ | OpCode::GetAndTouchQ)
    )
}

fn loud(opcode: OpCode) -> OpCode {
    match opcode {
        OpCode::GetQ => OpCode::Get,
        OpCode::GetKQ => OpCode::GetK,
        OpCode::SetQ => OpCode::Set,
        OpCode::AddQ => OpCode::Add,
        OpCode::ReplaceQ => OpCode::Replace,
        OpCode::DeleteQ => OpCode::Delete,
        OpCode::IncrementQ => OpCode::Increment,
        OpCode::DecrementQ => OpCode::Decrement,
        OpCode::FlushQ => OpCode::Flush,
        OpCode::AppendQ => OpCode::Append,
        OpCode::PrependQ => OpCode::Prepend,
        OpCode::GetAndTouchQ => OpCode::GetAndTouch,
        other => other,
    }
}

fn handle(store: &Mutex<Store>, opcode: OpCode, request: &Request) -> Vec<Reply> {
    let mut store = store.lock().unwrap();
    let key = request.key.clone();

    let reply = match opcode {
        OpCode::Get | OpCode::GetK | OpCode::GetAndTouch => match store.items.get(&key) {
            Some(entry) => Reply {
                status: Status::NoError,
                cas: entry.cas,
                extra: entry.flags.to_be_bytes().to_vec(),
                key: if opcode == OpCode::GetK { key } else { Vec::new() },
                value: entry.value.clone(),
            },
            None => Reply::status(Status::KeyNotFound),
        },
        OpCode::Set | OpCode::Add | OpCode::Replace => {
            let existing = store.items.get(&key).map(|entry| entry.cas);
            let conflict = match (opcode, existing) {
                (OpCode::Add, Some(_)) => Some(Status::KeyExists),
                (OpCode::Replace, None) => Some(Status::KeyNotFound),
                (_, None) if request.cas != 0 => Some(Status::KeyNotFound),
                (_, Some(cas)) if request.cas != 0 && request.cas != cas => Some(Status::KeyExists),
                _ => None,
            };
            match conflict {
                Some(status) => Reply::status(status),
                None => {
                    let flags = u32::from_be_bytes(request.extra[0..4].try_into().unwrap());
                    let cas = store.bump();
                    store.items.insert(
                        key,
                        Entry {
                            flags,
                            value: request.value.clone(),
                            cas,
                        },
                    );
                    Reply { cas, ..Reply::ok() }
                }
            }
        }
        OpCode::Delete => match store.items.remove(&key) {
            Some(_) => Reply::ok(),
            None => Reply::status(Status::KeyNotFound),
        },
        OpCode::Increment | OpCode::Decrement => {
            let delta = u64::from_be_bytes(request.extra[0..8].try_into().unwrap());
            let initial = u64::from_be_bytes(request.extra[8..16].try_into().unwrap());
            let expiry = u32::from_be_bytes(request.extra[16..20].try_into().unwrap());
            let current = store.items.get(&key).map(|entry| entry.value.clone());
            let next = match current {
                None if expiry == u32::MAX => None,
                None => Some(Ok(initial)),
                Some(raw) => Some(
                    std::str::from_utf8(&raw)
                        .ok()
                        .and_then(|text| text.parse::<u64>().ok())
                        .map(|value| match opcode {
                            OpCode::Increment => value.wrapping_add(delta),
                            _ => value.saturating_sub(delta),
                        })
                        .ok_or(Status::IncrDecrNonNumericValue),
                ),
            };
            match next {
                None => Reply::status(Status::KeyNotFound),
                Some(Err(status)) => Reply::status(status),
                Some(Ok(value)) => {
                    let cas = store.bump();
                    store.items.insert(
                        key,
                        Entry {
                            flags: 0,
                            value: value.to_string().into_bytes(),
                            cas,
                        },
                    );
                    Reply {
                        cas,
                        value: value.to_be_bytes().to_vec(),
                        ..Reply::ok()
                    }
                }
            }
        }
        OpCode::Touch => match store.items.get(&key) {
            Some(entry) => Reply {
                cas: entry.cas,
                ..Reply::ok()
            },
            None => Reply::status(Status::KeyNotFound),
        },
        OpCode::Append | OpCode::Prepend => {
            let cas = store.bump();
            match store.items.get_mut(&key) {
                Some(entry) => {
                    if opcode == OpCode::Append {
                        entry.value.extend_from_slice(&request.value);
                    } else {
                        let mut value = request.value.clone();
                        value.extend_from_slice(&entry.value);
                        entry.value = value;
                    }
                    entry.cas = cas;
                    Reply { cas, ..Reply::ok() }
                }
                None => Reply::status(Status::ItemNotStored),
            }
        }
        OpCode::Stat => {
            let count = store.items.len().to_string();
            let stat = |name: &str, value: &str| Reply {
                key: name.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
                ..Reply::ok()
            };
            return vec![
                stat("pid", &std::process::id().to_string()),
                stat("curr_items", &count),
                Reply::ok(),
            ];
        }
        OpCode::Flush => {
            store.items.clear();
            Reply::ok()
        }
        OpCode::NoOp => Reply::ok(),
        _ => Reply::status(Status::UnknownCommand),
    };
    vec![reply]
}

fn read_request(stream: &mut TcpStream) -> io::Result<Request> {
    let mut header = [0u8; HEADER_LENGTH];
    stream.read_exact(&mut header)?;
    if header[0] != 0x80 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request magic"));
    }

    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extra_len = header[4] as usize;
    let body_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let opaque = u32::from_be_bytes(header[12..16].try_into().unwrap());
    let cas = u64::from_be_bytes(header[16..24].try_into().unwrap());

    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body)?;
    let value = body.split_off(extra_len + key_len);
    let key = body.split_off(extra_len);

    Ok(Request {
        opcode: header[1],
        opaque,
        cas,
        extra: body,
        key,
        value,
    })
}

fn write_reply(stream: &mut TcpStream, request: &Request, reply: Reply) -> io::Result<()> {
    let body_len = reply.extra.len() + reply.key.len() + reply.value.len();
    let mut frame = Vec::with_capacity(HEADER_LENGTH + body_len);
    frame.push(RESPONSE_MAGIC);
    frame.push(request.opcode);
    frame.extend_from_slice(&(reply.key.len() as u16).to_be_bytes());
    frame.push(reply.extra.len() as u8);
    frame.push(0);
    frame.extend_from_slice(&reply.status.as_u16().to_be_bytes());
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&request.opaque.to_be_bytes());
    frame.extend_from_slice(&reply.cas.to_be_bytes());
    frame.extend_from_slice(&reply.extra);
    frame.extend_from_slice(&reply.key);
    frame.extend_from_slice(&reply.value);
    stream.write_all(&frame)
}
