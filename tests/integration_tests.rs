//! Integration tests exercising the client and server over real loopback
//! sockets: exact wire bytes against scripted peers, out-of-order response
//! pairing, cancellation, and end-to-end traffic through the register bank.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use duplex_modbus::{
    Client, Config, Connection, Exception, Handler, ModbusError, Mux, RegisterBank, Server,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn client_for(addr: SocketAddr, unit_id: u8) -> Client {
    Client::new(Config {
        endpoint: addr.to_string(),
        unit_id,
        ..Default::default()
    })
}

/// Start a register-bank server on an ephemeral port. Returns the bound
/// address, the bank, the cancel token tearing the server down, and the
/// serve task.
async fn spawn_bank_server() -> (
    SocketAddr,
    Arc<RegisterBank>,
    CancellationToken,
    JoinHandle<Result<(), ModbusError>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bank = Arc::new(RegisterBank::new());
    let handler = Arc::new(Mux::with_bank(Arc::clone(&bank)));
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        Server::new(Config::default())
            .serve_listener(&serve_cancel, listener, handler)
            .await
    });
    (addr, bank, cancel, task)
}

/// S1 + S2: exact request bytes on the wire, canned responses back.
#[tokio::test]
async fn test_scripted_slave_wire_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let slave = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut first = [0u8; 12];
        socket.read_exact(&mut first).await.unwrap();
        socket
            .write_all(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00,
                0x00, 0x64,
            ])
            .await
            .unwrap();

        let mut second = [0u8; 12];
        socket.read_exact(&mut second).await.unwrap();
        socket
            .write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x11, 0xE3, 0x01])
            .await
            .unwrap();

        (first, second)
    });

    let client = client_for(addr, 0x11);
    let cancel = CancellationToken::new();

    // S1: Read Holding Registers, addr 107, qty 3.
    let res = timeout(
        TEST_TIMEOUT,
        client.request(&cancel, 0x11, 0x03, &[0x00, 0x6B, 0x00, 0x03]),
    )
    .await
    .unwrap();
    assert_eq!(res, Ok(vec![0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]));

    // S2: unsupported function code answered with IllegalFunction.
    let res = timeout(
        TEST_TIMEOUT,
        client.request(&cancel, 0x11, 0x63, &[0x00, 0x00, 0x00, 0x01]),
    )
    .await
    .unwrap();
    assert_eq!(res, Err(Exception::IllegalFunction.into()));

    let (first, second) = slave.await.unwrap();
    assert_eq!(
        first,
        [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
    );
    assert_eq!(
        second,
        [0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x63, 0x00, 0x00, 0x00, 0x01]
    );

    client.disconnect().await;
}

/// S3: two concurrent requests, responses delivered in reverse order. Each
/// call must claim the response carrying its own transaction id.
#[tokio::test]
async fn test_out_of_order_responses() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Collect both requests before answering either.
        let mut requests = Vec::new();
        for _ in 0..2 {
            let mut req = [0u8; 12];
            socket.read_exact(&mut req).await.unwrap();
            requests.push(req);
        }

        // Answer in reverse order, echoing the requested address as the
        // register value so the test can tell the responses apart. The gap
        // keeps the two frames in separate reads on the client side.
        for req in requests.iter().rev() {
            let response = [
                req[0], req[1], 0x00, 0x00, 0x00, 0x05, req[6], req[7], 0x02, req[8], req[9],
            ];
            socket.write_all(&response).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        }
    });

    let client = client_for(addr, 0x11);
    let cancel = CancellationToken::new();

    let (a, b) = timeout(TEST_TIMEOUT, async {
        tokio::join!(
            client.request(&cancel, 0x11, 0x03, &[0x00, 0xAA, 0x00, 0x01]),
            async {
                // Keep the two request writes out of a single server read;
                // the responses still arrive reversed.
                sleep(Duration::from_millis(20)).await;
                client.request(&cancel, 0x11, 0x03, &[0x00, 0xBB, 0x00, 0x01]).await
            },
        )
    })
    .await
    .unwrap();

    assert_eq!(a, Ok(vec![0x02, 0x00, 0xAA]));
    assert_eq!(b, Ok(vec![0x02, 0x00, 0xBB]));

    client.disconnect().await;
}

/// S6: cancelling a request after the write removes its receiver and leaves
/// the connection usable for the next request.
#[tokio::test]
async fn test_cancellation_releases_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Swallow the first request without answering.
        let mut req = [0u8; 12];
        socket.read_exact(&mut req).await.unwrap();

        // Answer the second one properly.
        socket.read_exact(&mut req).await.unwrap();
        let response = [
            req[0], req[1], 0x00, 0x00, 0x00, 0x05, req[6], req[7], 0x02, 0x00, 0x2A,
        ];
        socket.write_all(&response).await.unwrap();
    });

    let client = client_for(addr, 0x11);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let res = timeout(
        TEST_TIMEOUT,
        client.request(&cancel, 0x11, 0x03, &[0x00, 0x00, 0x00, 0x01]),
    )
    .await
    .unwrap();
    assert_eq!(res, Err(ModbusError::Cancelled));

    // The connection survives and the next transaction pairs normally.
    let cancel = CancellationToken::new();
    let res = timeout(
        TEST_TIMEOUT,
        client.request(&cancel, 0x11, 0x03, &[0x00, 0x00, 0x00, 0x01]),
    )
    .await
    .unwrap();
    assert_eq!(res, Ok(vec![0x02, 0x00, 0x2A]));

    client.disconnect().await;
}

/// Invariant 3: concurrent writes reach the wire as whole, non-interleaved
/// ADUs in some order.
#[tokio::test]
async fn test_concurrent_tx_does_not_interleave() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 200];
        socket.read_exact(&mut buf).await.unwrap();
        buf
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let connection = Connection::new(stream);
    let cancel = CancellationToken::new();

    let a = vec![0xAAu8; 100];
    let b = vec![0xBBu8; 100];
    let (ra, rb) = tokio::join!(connection.tx(&cancel, &a), connection.tx(&cancel, &b));
    ra.unwrap();
    rb.unwrap();

    let wire = timeout(TEST_TIMEOUT, peer).await.unwrap().unwrap();
    let mut ab = a.clone();
    ab.extend_from_slice(&b);
    let mut ba = b;
    ba.extend_from_slice(&a);
    assert!(wire == ab || wire == ba);

    connection.close();
}

/// Properties 5 and 6: close is idempotent, wakes registered receivers, and
/// fails subsequent operations fast.
#[tokio::test]
async fn test_close_is_idempotent_and_wakes_receivers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let keep_open = tokio::spawn(async move { listener.accept().await });

    let stream = TcpStream::connect(addr).await.unwrap();
    let connection = Connection::new(stream);
    let cancel = CancellationToken::new();

    let wait = connection.rx(&cancel, |_| false).await.unwrap();
    assert!(connection.ready());

    connection.close();
    connection.close();
    assert!(!connection.ready());

    timeout(TEST_TIMEOUT, wait.wait()).await.unwrap();

    assert_eq!(
        connection.tx(&cancel, &[0u8; 4]).await,
        Err(ModbusError::Closed)
    );
    assert!(connection.rx(&cancel, |_| true).await.is_err());

    drop(keep_open);
}

/// Property 8: the server's response echoes the request's transaction id
/// byte for byte, observed on a raw socket.
#[tokio::test]
async fn test_server_preserves_transaction_id() {
    let (addr, bank, cancel, task) = spawn_bank_server().await;
    bank.write_registers(107, &[0x022B, 0x0000, 0x0064]).unwrap();

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(&[0xAB, 0xCD, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03])
        .await
        .unwrap();

    let mut response = [0u8; 15];
    timeout(TEST_TIMEOUT, socket.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        [0xAB, 0xCD, 0x00, 0x00, 0x00, 0x09, 0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]
    );

    cancel.cancel();
    let _ = timeout(TEST_TIMEOUT, task).await.unwrap();
}

/// S4 and S5 against the real server: write echo on success, shaped
/// exception for a zero quantity.
#[tokio::test]
async fn test_server_write_echo_and_bad_quantity() {
    let (addr, bank, cancel, task) = spawn_bank_server().await;
    let client = client_for(addr, 0x11);
    let client_cancel = CancellationToken::new();

    // S4: the coil write is echoed, so the call succeeds.
    timeout(
        TEST_TIMEOUT,
        client.write_single_coil(&client_cancel, 0x00AC, true),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(bank.read_coils(0x00AC, 1).unwrap(), vec![true]);

    // S5: quantity 0 passes through raw and comes back IllegalDataValue.
    let res = timeout(
        TEST_TIMEOUT,
        client.request(&client_cancel, 0x11, 0x03, &[0x00, 0x00, 0x00, 0x00]),
    )
    .await
    .unwrap();
    assert_eq!(res, Err(Exception::IllegalDataValue.into()));

    client.disconnect().await;
    cancel.cancel();
    let _ = timeout(TEST_TIMEOUT, task).await.unwrap();
}

/// End-to-end traffic through every high-level operation.
#[tokio::test]
async fn test_end_to_end_operations() {
    let (addr, bank, cancel, task) = spawn_bank_server().await;
    bank.set_input_registers(5, &[0x0A0B, 0x0C0D]).unwrap();
    bank.set_discrete_inputs(5, &[true, false, true]).unwrap();

    let client = client_for(addr, 1);
    let c = CancellationToken::new();

    timeout(TEST_TIMEOUT, async {
        client
            .write_multiple_registers(&c, 200, &[1, 2, 3])
            .await
            .unwrap();
        client.write_single_register(&c, 203, 4).await.unwrap();
        assert_eq!(
            client.read_holding_registers(&c, 200, 4).await.unwrap(),
            vec![1, 2, 3, 4]
        );

        client
            .write_multiple_coils(&c, 20, &[true, false, true, true])
            .await
            .unwrap();
        client.write_single_coil(&c, 24, true).await.unwrap();
        assert_eq!(
            client.read_coils(&c, 20, 5).await.unwrap(),
            vec![true, false, true, true, true]
        );

        assert_eq!(
            client.read_input_registers(&c, 5, 2).await.unwrap(),
            vec![0x0A0B, 0x0C0D]
        );
        assert_eq!(
            client.read_discrete_inputs(&c, 5, 3).await.unwrap(),
            vec![true, false, true]
        );

        // Write happens before the read in the combined operation.
        assert_eq!(
            client
                .read_write_multiple_registers(&c, 200, 2, 200, &[9, 8])
                .await
                .unwrap(),
            vec![9, 8]
        );
    })
    .await
    .unwrap();

    client.disconnect().await;
    cancel.cancel();
    let _ = timeout(TEST_TIMEOUT, task).await.unwrap();
}

/// Handler that answers reads after a per-address delay, forcing responses
/// out of order while requests stay concurrent.
struct StaggeredHandler;

#[async_trait]
impl Handler for StaggeredHandler {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        code: u8,
        req: &[u8],
    ) -> Result<Vec<u8>, Exception> {
        assert_eq!(code, 0x03);
        let address = u16::from_be_bytes([req[0], req[1]]);
        // Lower addresses answer later.
        sleep(Duration::from_millis(20 * (8 - address as u64))).await;
        Ok(vec![0x02, req[0], req[1]])
    }
}

/// Property 4: N concurrent requests each claim the response with their
/// transaction id even when the server reverses completion order.
#[tokio::test]
async fn test_concurrent_requests_pair_by_transaction_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        Server::new(Config::default())
            .serve_listener(&serve_cancel, listener, Arc::new(StaggeredHandler))
            .await
    });

    let client = Arc::new(client_for(addr, 0x11));
    let c = CancellationToken::new();

    let mut calls = Vec::new();
    for address in 0u16..8 {
        let client = Arc::clone(&client);
        let c = c.clone();
        calls.push(tokio::spawn(async move {
            let body = [0x00, address as u8, 0x00, 0x01];
            let res = client.request(&c, 0x11, 0x03, &body).await;
            (address, res)
        }));
        // Space the submissions so each request lands in its own read on
        // the server side; completion order is still reversed by the
        // handler's staggered delays.
        sleep(Duration::from_millis(15)).await;
    }

    for call in calls {
        let (address, res) = timeout(TEST_TIMEOUT, call).await.unwrap().unwrap();
        assert_eq!(res, Ok(vec![0x02, 0x00, address as u8]));
    }

    client.disconnect().await;
    cancel.cancel();
    let res = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(res, Err(ModbusError::Cancelled));
}

/// A client pointed at an invalid configuration fails before dialing.
#[tokio::test]
async fn test_invalid_configuration_surfaces_early() {
    let client = Client::new(Config {
        mode: "ascii".to_string(),
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let res = client.request(&cancel, 1, 0x03, &[0, 0, 0, 1]).await;
    assert!(matches!(res, Err(ModbusError::InvalidParameter { .. })));

    let server = Server::new(Config {
        kind: "serial".to_string(),
        ..Default::default()
    });
    let res = server
        .serve(&cancel, Arc::new(Mux::default()))
        .await;
    assert!(matches!(res, Err(ModbusError::InvalidParameter { .. })));
}

/// Disconnect mid-flight surfaces a transport error to the waiting request
/// and a later request transparently re-dials.
#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (addr, bank, cancel, task) = spawn_bank_server().await;
    bank.write_registers(0, &[0x1111]).unwrap();

    let client = client_for(addr, 1);
    let c = CancellationToken::new();

    assert_eq!(
        timeout(TEST_TIMEOUT, client.read_holding_registers(&c, 0, 1))
            .await
            .unwrap()
            .unwrap(),
        vec![0x1111]
    );
    assert!(client.ready().await);

    client.disconnect().await;
    assert!(!client.ready().await);

    // Lazy re-establishment: the next call dials again.
    assert_eq!(
        timeout(TEST_TIMEOUT, client.read_holding_registers(&c, 0, 1))
            .await
            .unwrap()
            .unwrap(),
        vec![0x1111]
    );

    client.disconnect().await;
    cancel.cancel();
    let _ = timeout(TEST_TIMEOUT, task).await.unwrap();
}
