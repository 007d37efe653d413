//! Loopback demonstration: starts a register-bank-backed server on an
//! ephemeral port and drives it with a client.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use duplex_modbus::{Client, Config, Mux, RegisterBank, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("duplex-modbus demo");
    println!("==================");

    let bank = Arc::new(RegisterBank::new());
    bank.set_input_registers(0, &[0x0101, 0x0202, 0x0303])?;
    bank.set_discrete_inputs(0, &[true, false, true])?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = listener.local_addr()?.to_string();
    println!("server listening on {endpoint}");

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let server = Server::new(Config::default());
        let _ = server
            .serve_listener(&server_cancel, listener, Arc::new(Mux::with_bank(bank)))
            .await;
    });

    let client = Client::new(Config {
        endpoint,
        unit_id: 1,
        ..Default::default()
    });

    println!("\nwrite operations");
    client.write_single_register(&cancel, 100, 0x1234).await?;
    println!("  wrote 0x1234 to holding register 100");
    client
        .write_multiple_registers(&cancel, 101, &[0xAAAA, 0xBBBB, 0xCCCC])
        .await?;
    println!("  wrote 3 registers starting at 101");
    client.write_single_coil(&cancel, 10, true).await?;
    client
        .write_multiple_coils(&cancel, 11, &[false, true, true])
        .await?;
    println!("  wrote 4 coils starting at 10");

    println!("\nread operations");
    let registers = client.read_holding_registers(&cancel, 100, 4).await?;
    println!("  holding registers 100..104: {registers:04X?}");
    let coils = client.read_coils(&cancel, 10, 4).await?;
    println!("  coils 10..14: {coils:?}");
    let inputs = client.read_input_registers(&cancel, 0, 3).await?;
    println!("  input registers 0..3: {inputs:04X?}");
    let discretes = client.read_discrete_inputs(&cancel, 0, 3).await?;
    println!("  discrete inputs 0..3: {discretes:?}");

    println!("\ncombined read/write");
    let readback = client
        .read_write_multiple_registers(&cancel, 100, 2, 100, &[0x5555, 0x6666])
        .await?;
    println!("  registers after write: {readback:04X?}");

    println!("\nexpected failure");
    match client.read_holding_registers(&cancel, 9990, 100).await {
        Err(err) => println!("  read past the register bank: {err}"),
        Ok(_) => println!("  unexpectedly succeeded"),
    }

    client.disconnect().await;
    cancel.cancel();
    let _ = server.await;
    println!("\ndone");
    Ok(())
}
