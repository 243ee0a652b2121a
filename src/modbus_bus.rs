//! Modbus TCP view of the property store.
//!
//! Every numeric path in [`BUS_LAYOUT`] occupies four holding registers starting
//! at [`REGISTER_BASE`], holding the value as an f64 with the most significant
//! word first.
//! Reads serve the current store value; writes of whole values go through
//! [`PropertyStore::write_external`], so the next poll cycle overwrites them.

use crate::property_store::{Access, PropertyStore};
use std::{future, net::SocketAddr};
use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{info, trace, warn};

pub const REGISTER_BASE: u16 = 40000;

/// Registers per value: one f64.
pub const WORDS_PER_VALUE: u16 = 4;

pub const BUS_LAYOUT: [&str; 23] = [
    "/Ac/Power",
    "/Ac/Current",
    "/Ac/Voltage",
    "/Ac/Energy/Forward",
    "/Ac/Energy/Reverse",
    "/Ac/L1/Voltage",
    "/Ac/L2/Voltage",
    "/Ac/L3/Voltage",
    "/Ac/L1/Current",
    "/Ac/L2/Current",
    "/Ac/L3/Current",
    "/Ac/L1/Power",
    "/Ac/L2/Power",
    "/Ac/L3/Power",
    "/Ac/L1/Frequency",
    "/Ac/L2/Frequency",
    "/Ac/L3/Frequency",
    "/UpdateIndex",
    "/DeviceInstance",
    "/ProductId",
    "/FirmwareVersion",
    "/HardwareVersion",
    "/Connected",
];

/// First register of `path`, if the path is on the bus.
pub fn register_for(path: &str) -> Option<u16> {
    BUS_LAYOUT
        .iter()
        .position(|p| *p == path)
        .map(|index| REGISTER_BASE + WORDS_PER_VALUE * index as u16)
}

/// Path at `register` and the word's position within the value, 0 being the
/// most significant.
fn slot(register: u32) -> Option<(&'static str, u32)> {
    let offset = register.checked_sub(u32::from(REGISTER_BASE))?;
    let words = u32::from(WORDS_PER_VALUE);
    let path = *BUS_LAYOUT.get((offset / words) as usize)?;
    Some((path, offset % words))
}

/// Splits `value` into registers, most significant word first.
pub fn f64_to_words(value: f64) -> [u16; 4] {
    let bits = value.to_bits();
    [
        (bits >> 48) as u16,
        (bits >> 32) as u16,
        (bits >> 16) as u16,
        bits as u16,
    ]
}

pub fn words_to_f64(words: &[u16]) -> f64 {
    let bits = words
        .iter()
        .fold(0u64, |bits, word| (bits << 16) | u64::from(*word));
    f64::from_bits(bits)
}

#[derive(Clone)]
pub struct ModbusBus {
    store: PropertyStore,
}

impl tokio_modbus::server::Service for ModbusBus {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                trace!("Holding register read for {addr}/{cnt}");
                self.read_registers(addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            Request::WriteMultipleRegisters(addr, values) => {
                trace!("Holding register write at {addr}: {values:?}");
                self.write_registers(addr, &values)
                    .map(|()| Response::WriteMultipleRegisters(addr, values.len() as u16))
            }
            _ => {
                warn!("Unsupported Modbus function in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl ModbusBus {
    pub fn new(store: PropertyStore) -> Self {
        Self { store }
    }

    fn read_registers(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let start = u32::from(addr);
        (start..start + u32::from(cnt))
            .map(|register| {
                let (path, word) = slot(register).ok_or(ExceptionCode::IllegalDataAddress)?;
                let value = self
                    .store
                    .get(path)
                    .and_then(|v| v.as_f64())
                    .ok_or(ExceptionCode::IllegalDataAddress)?;
                Ok(f64_to_words(value)[word as usize])
            })
            .collect()
    }

    fn write_registers(&self, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let words = usize::from(WORDS_PER_VALUE);
        if values.is_empty() || values.len() % words != 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let start = u32::from(addr);
        let mut writes = Vec::with_capacity(values.len() / words);
        for (i, chunk) in values.chunks_exact(words).enumerate() {
            let (path, word) = slot(start + (i * words) as u32)
                .ok_or(ExceptionCode::IllegalDataAddress)?;
            if word != 0 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            writes.push((path, words_to_f64(chunk)));
        }

        // Check every target first so a rejected write leaves the store untouched.
        if writes
            .iter()
            .any(|(path, _)| !self.store_writeable(path))
        {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        for (path, value) in writes {
            self.store
                .write_external(path, value)
                .map_err(|_| ExceptionCode::IllegalDataAddress)?;
        }
        Ok(())
    }

    /// `false` for read-only and unregistered paths.
    fn store_writeable(&self, path: &str) -> bool {
        self.store.access(path) == Some(Access::Writeable)
    }
}

pub async fn serve(socket_addr: SocketAddr, bus: ModbusBus) -> anyhow::Result<()> {
    let listener = TcpListener::bind(socket_addr).await?;
    serve_listener(listener, bus).await
}

pub async fn serve_listener(listener: TcpListener, bus: ModbusBus) -> anyhow::Result<()> {
    info!("Serving property store over Modbus TCP on {}", listener.local_addr()?);
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(bus.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("Modbus connection error: {err}");
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}
