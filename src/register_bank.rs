//! In-memory data store for server applications.
//!
//! A [`RegisterBank`] holds the four standard Modbus data tables behind
//! read/write locks and reports out-of-range access as protocol exceptions,
//! so it plugs straight into a [`Mux`] via [`Mux::with_bank`]. The store is
//! purely in-memory; it exists for demos, tests and simple slaves, not for
//! durable state.

use std::sync::{Arc, RwLock};

use crate::error::Exception;
use crate::handler::Mux;

const DEFAULT_TABLE_SIZE: usize = 10_000;

/// Thread-safe coil and register storage.
#[derive(Debug)]
pub struct RegisterBank {
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBank {
    /// Bank with 10,000 entries per table, all zero.
    pub fn new() -> Self {
        Self::with_sizes(
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
        )
    }

    pub fn with_sizes(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> Self {
        Self {
            coils: RwLock::new(vec![false; coils]),
            discrete_inputs: RwLock::new(vec![false; discrete_inputs]),
            holding_registers: RwLock::new(vec![0; holding_registers]),
            input_registers: RwLock::new(vec![0; input_registers]),
        }
    }

    fn read_range<T: Copy>(
        table: &RwLock<Vec<T>>,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<T>, Exception> {
        let table = table.read().unwrap();
        let start = address as usize;
        let end = start + quantity as usize;
        if end > table.len() {
            return Err(Exception::IllegalDataAddress);
        }
        Ok(table[start..end].to_vec())
    }

    fn write_range<T: Copy>(
        table: &RwLock<Vec<T>>,
        address: u16,
        values: &[T],
    ) -> Result<(), Exception> {
        let mut table = table.write().unwrap();
        let start = address as usize;
        let end = start + values.len();
        if end > table.len() {
            return Err(Exception::IllegalDataAddress);
        }
        table[start..end].copy_from_slice(values);
        Ok(())
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, Exception> {
        Self::read_range(&self.coils, address, quantity)
    }

    pub fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, Exception> {
        Self::read_range(&self.discrete_inputs, address, quantity)
    }

    pub fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, Exception> {
        Self::read_range(&self.holding_registers, address, quantity)
    }

    pub fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, Exception> {
        Self::read_range(&self.input_registers, address, quantity)
    }

    pub fn write_coil(&self, address: u16, status: bool) -> Result<(), Exception> {
        Self::write_range(&self.coils, address, &[status])
    }

    pub fn write_coils(&self, address: u16, status: &[bool]) -> Result<(), Exception> {
        Self::write_range(&self.coils, address, status)
    }

    pub fn write_register(&self, address: u16, value: u16) -> Result<(), Exception> {
        Self::write_range(&self.holding_registers, address, &[value])
    }

    pub fn write_registers(&self, address: u16, values: &[u16]) -> Result<(), Exception> {
        Self::write_range(&self.holding_registers, address, values)
    }

    /// Provision discrete inputs, which clients can only read.
    pub fn set_discrete_inputs(&self, address: u16, status: &[bool]) -> Result<(), Exception> {
        Self::write_range(&self.discrete_inputs, address, status)
    }

    /// Provision input registers, which clients can only read.
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> Result<(), Exception> {
        Self::write_range(&self.input_registers, address, values)
    }
}

impl Mux {
    /// A mux serving all nine supported function codes out of `bank`.
    ///
    /// Read/Write Multiple Registers performs the write before the read, as
    /// the protocol specifies.
    pub fn with_bank(bank: Arc<RegisterBank>) -> Self {
        let b = Arc::clone(&bank);
        let read_coils: Box<crate::handler::ReadBitsFn> =
            Box::new(move |address, quantity| b.read_coils(address, quantity));
        let b = Arc::clone(&bank);
        let read_discrete_inputs: Box<crate::handler::ReadBitsFn> =
            Box::new(move |address, quantity| b.read_discrete_inputs(address, quantity));
        let b = Arc::clone(&bank);
        let read_holding_registers: Box<crate::handler::ReadWordsFn> =
            Box::new(move |address, quantity| b.read_holding_registers(address, quantity));
        let b = Arc::clone(&bank);
        let read_input_registers: Box<crate::handler::ReadWordsFn> =
            Box::new(move |address, quantity| b.read_input_registers(address, quantity));
        let b = Arc::clone(&bank);
        let write_single_coil: Box<crate::handler::WriteBitFn> =
            Box::new(move |address, status| b.write_coil(address, status));
        let b = Arc::clone(&bank);
        let write_single_register: Box<crate::handler::WriteWordFn> =
            Box::new(move |address, value| b.write_register(address, value));
        let b = Arc::clone(&bank);
        let write_multiple_coils: Box<crate::handler::WriteBitsFn> =
            Box::new(move |address, status| b.write_coils(address, status));
        let b = Arc::clone(&bank);
        let write_multiple_registers: Box<crate::handler::WriteWordsFn> =
            Box::new(move |address, values| b.write_registers(address, values));
        let b = bank;
        let read_write_multiple_registers: Box<crate::handler::ReadWriteWordsFn> = Box::new(
            move |read_address, read_quantity, write_address, values| {
                b.write_registers(write_address, values)?;
                b.read_holding_registers(read_address, read_quantity)
            },
        );

        Self {
            fallback: None,
            read_coils: Some(read_coils),
            read_discrete_inputs: Some(read_discrete_inputs),
            read_holding_registers: Some(read_holding_registers),
            read_input_registers: Some(read_input_registers),
            write_single_coil: Some(write_single_coil),
            write_single_register: Some(write_single_register),
            write_multiple_coils: Some(write_multiple_coils),
            write_multiple_registers: Some(write_multiple_registers),
            read_write_multiple_registers: Some(read_write_multiple_registers),
        }
    }
}
