use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use modbus_engine::mbap::build_frame;
use modbus_engine::{DisplayFormat, ModbusServer, PrimaryTable, RegisterFile};

const REGISTERS: &str = "\
PORT;502
40206;2;FFFF;MyFloat;;Float;-3.14159
40011;2;FFFF;Counter;;Long;0
40001;1;FFFF;Speed;;Uint;0
40002;1;FFFF;Torque;;Int;0
00001;1;FFFF;Lamp1;;Bool;0
00002;1;FFFF;Lamp2;;Bool;0
";

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn start_server() -> Result<(ModbusServer, String), Box<dyn std::error::Error>> {
    let store = RegisterFile::from_str(REGISTERS)?.build_store()?;
    let server = ModbusServer::new(store);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = server.run_listener_on(listener)?;
    Ok((server, format!("127.0.0.1:{}", addr.port())))
}

async fn exchange(stream: &mut TcpStream, request: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
    stream.write_all(request).await?;
    let mut resp = vec![0u8; expected_len];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut resp))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no response"))??;
    Ok(resp)
}

#[tokio::test]
async fn read_float_composite() -> TestResult {
    let (server, addr) = start_server().await?;
    let mut s = TcpStream::connect(&addr).await?;
    let resp = exchange(&mut s, &build_frame(1, 1, &[0x03, 0x00, 0xCD, 0x00, 0x02]), 13).await?;
    assert_eq!(&resp[..9], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04]);
    let words = [
        u16::from_be_bytes([resp[9], resp[10]]),
        u16::from_be_bytes([resp[11], resp[12]]),
    ];
    assert_eq!(DisplayFormat::Float.format_words(&words)?, "-3.14159");
    server.close();
    Ok(())
}

#[tokio::test]
async fn write_multiple_then_read_back() -> TestResult {
    let (server, addr) = start_server().await?;
    let mut events = server.store().subscribe();
    let mut s = TcpStream::connect(&addr).await?;
    let req = build_frame(7, 1, &[0x10, 0x00, 0x0A, 0x00, 0x02, 0x04, 0x12, 0x34, 0x00, 0x01]);
    let resp = exchange(&mut s, &req, 12).await?;
    assert_eq!(resp, build_frame(7, 1, &[0x10, 0x00, 0x0A, 0x00, 0x02]));
    let resp = exchange(&mut s, &build_frame(8, 1, &[0x03, 0x00, 0x0A, 0x00, 0x02]), 13).await?;
    assert_eq!(&resp[9..], &[0x12, 0x34, 0x00, 0x01]);
    assert_eq!(
        server.store().get(PrimaryTable::HoldingRegister, "Counter")?,
        0x0001_1234.to_string()
    );
    let ev = events.try_recv()?;
    assert_eq!(ev.name, "Counter");
    assert_eq!(ev.table, PrimaryTable::HoldingRegister);
    server.close();
    Ok(())
}

#[tokio::test]
async fn exceptions_keep_connection_open() -> TestResult {
    let (server, addr) = start_server().await?;
    let mut s = TcpStream::connect(&addr).await?;
    // FC6 to an unmapped address
    let resp = exchange(&mut s, &build_frame(2, 1, &[0x06, 0x01, 0x00, 0x00, 0x01]), 9).await?;
    assert_eq!(resp, build_frame(2, 1, &[0x86, 0x02]));
    // FC15 whose byte count disagrees with the coil count
    let resp = exchange(&mut s, &build_frame(3, 1, &[0x0F, 0x00, 0x00, 0x00, 0x02, 0x02, 0x03, 0x00]), 9).await?;
    assert_eq!(resp, build_frame(3, 1, &[0x8F, 0x03]));
    // unsupported function code
    let resp = exchange(&mut s, &build_frame(4, 1, &[0x2B, 0x0E, 0x01, 0x00]), 9).await?;
    assert_eq!(resp, build_frame(4, 1, &[0xAB, 0x01]));
    // still serving
    let resp = exchange(&mut s, &build_frame(5, 1, &[0x05, 0x00, 0x01, 0xFF, 0x00]), 12).await?;
    assert_eq!(resp, build_frame(5, 1, &[0x05, 0x00, 0x01, 0xFF, 0x00]));
    assert_eq!(server.store().get(PrimaryTable::Coil, "Lamp2")?, "1");
    server.close();
    Ok(())
}

#[tokio::test]
async fn malformed_header_closes_connection() -> TestResult {
    let (server, addr) = start_server().await?;
    let mut s = TcpStream::connect(&addr).await?;
    let mut req = build_frame(1, 1, &[0x06, 0x00, 0x00, 0x00, 0x2A]);
    req[5] = 0x01; // length below the 2-byte minimum
    s.write_all(&req).await?;
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), s.read(&mut buf)).await??;
    assert_eq!(n, 0, "expected close without a response");
    assert_eq!(server.store().get(PrimaryTable::HoldingRegister, "Speed")?, "0");
    server.close();
    Ok(())
}

#[tokio::test]
async fn pipelined_requests_answered_in_order() -> TestResult {
    let (server, addr) = start_server().await?;
    let mut s = TcpStream::connect(&addr).await?;
    let mut req = build_frame(20, 1, &[0x06, 0x00, 0x01, 0xFF, 0xFE]);
    req.extend_from_slice(&build_frame(21, 1, &[0x03, 0x00, 0x01, 0x00, 0x01]));
    let resp = exchange(&mut s, &req, 12 + 11).await?;
    let mut expected = build_frame(20, 1, &[0x06, 0x00, 0x01, 0xFF, 0xFE]);
    expected.extend_from_slice(&build_frame(21, 1, &[0x03, 0x02, 0xFF, 0xFE]));
    assert_eq!(resp, expected);
    assert_eq!(server.store().get(PrimaryTable::HoldingRegister, "Torque")?, "-2");
    server.close();
    Ok(())
}

#[tokio::test]
async fn close_terminates_connections() -> TestResult {
    let (server, addr) = start_server().await?;
    let mut s = TcpStream::connect(&addr).await?;
    exchange(&mut s, &build_frame(1, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]), 11).await?;
    assert_eq!(server.connections().len(), 1);
    server.close();
    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(Duration::from_secs(2), s.read(&mut buf)).await??;
    assert_eq!(n, 0);
    assert_eq!(server.state(), modbus_engine::ListenerState::Closed);
    Ok(())
}
