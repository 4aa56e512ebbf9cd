use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use modbus_engine::config::Config;
use modbus_engine::mbap::build_frame;
use modbus_engine::transport::Connection;
use modbus_engine::{
    ConnectionTarget, DisplayFormat, EntryDefinition, ExceptionCode, ModbusClient, ModbusError, ModbusServer,
    PrimaryTable, RegisterFile,
};

const REGISTERS: &str = "\
40206;2;FFFF;MyFloat;;Float;-3.14159
40011;2;FFFF;Counter;;Long;0
40101;1;FFFF;Status;;Hex;A5C3
40101;0;00F0;Mode;;Uint;
40101;0;8000;Enable;;Bool;
40021;4;FFFF;Label;;Str8;PUMP-01
30001;1;FFFF;Temp;;Int;21
00001;1;FFFF;Pump;;Bool;0
";

type TestResult = Result<(), Box<dyn std::error::Error>>;

const HR: PrimaryTable = PrimaryTable::HoldingRegister;

async fn server_and_client() -> Result<(ModbusServer, ModbusClient), Box<dyn std::error::Error>> {
    let file = RegisterFile::from_str(REGISTERS)?;
    let server = ModbusServer::new(file.build_store()?);
    let addr = server.run_listener_on(TcpListener::bind("127.0.0.1:0").await?)?;
    let client = ModbusClient::new(
        file.build_store()?,
        ConnectionTarget::direct("127.0.0.1", addr.port()),
    )
    .with_timeout(Duration::from_secs(2));
    Ok((server, client))
}

#[tokio::test]
async fn no_connection_before_connect() -> TestResult {
    let (server, client) = server_and_client().await?;
    assert!(!client.server_available());
    assert!(matches!(
        client.remote_value(HR, "MyFloat").await,
        Err(ModbusError::NoConnection)
    ));
    // local access needs no server
    client.set_local_value(HR, "Counter", "7")?;
    assert_eq!(client.local_value(HR, "Counter")?, "7");
    assert_eq!(server.store().get(HR, "Counter")?, "0");
    server.close();
    Ok(())
}

#[tokio::test]
async fn remote_reads_update_the_mirror() -> TestResult {
    let (server, client) = server_and_client().await?;
    client.connect().await?;
    assert!(client.server_available());

    server.store().set(HR, "MyFloat", "12.5")?;
    server.store().set(PrimaryTable::InputRegister, "Temp", "-7")?;
    let mut events = client.store().subscribe();

    assert_eq!(client.remote_value(HR, "MyFloat").await?, "12.5");
    assert_eq!(client.local_value(HR, "MyFloat")?, "12.5");
    assert_eq!(events.try_recv()?.name, "MyFloat");
    assert_eq!(client.remote_value(PrimaryTable::InputRegister, "Temp").await?, "-7");
    assert_eq!(client.remote_value(HR, "Label").await?, "PUMP-01");

    client.disconnect();
    assert!(!client.server_available());
    server.close();
    Ok(())
}

#[tokio::test]
async fn remote_writes_reach_the_server() -> TestResult {
    let (server, client) = server_and_client().await?;
    client.connect().await?;

    assert_eq!(client.set_remote_value(HR, "Counter", "-42").await?, "-42");
    assert_eq!(server.store().get(HR, "Counter")?, "-42");
    assert_eq!(client.set_remote_value(HR, "Label", "VALVE").await?, "VALVE");
    assert_eq!(server.store().get(HR, "Label")?, "VALVE");
    assert_eq!(client.set_remote_value(PrimaryTable::Coil, "Pump", "true").await?, "1");
    assert_eq!(server.store().get(PrimaryTable::Coil, "Pump")?, "1");

    assert!(matches!(
        client.set_remote_value(PrimaryTable::InputRegister, "Temp", "1").await,
        Err(ModbusError::ReadOnlyTable(PrimaryTable::InputRegister))
    ));
    // parse errors leave both sides alone
    assert!(client.set_remote_value(HR, "Counter", "forty").await.is_err());
    assert_eq!(client.local_value(HR, "Counter")?, "-42");
    server.close();
    Ok(())
}

#[tokio::test]
async fn secondary_write_is_read_modify_write() -> TestResult {
    let (server, client) = server_and_client().await?;
    client.connect().await?;

    // the server word moved on since the client loaded its file
    server.store().set(HR, "Status", "0F0F")?;
    assert_eq!(client.set_remote_value(HR, "Mode", "3").await?, "3");
    assert_eq!(server.store().get(HR, "Status")?, "0F3F");
    assert_eq!(client.local_value(HR, "Status")?, "0F3F");
    assert_eq!(client.local_value(HR, "Enable")?, "0");

    assert!(client.set_remote_value(HR, "Mode", "16").await.is_err());
    assert_eq!(server.store().get(HR, "Status")?, "0F3F");
    server.close();
    Ok(())
}

#[tokio::test]
async fn server_exception_and_unknown_name() -> TestResult {
    let (server, client) = server_and_client().await?;
    client
        .store()
        .define(HR, 499, EntryDefinition::new("Ghost", DisplayFormat::Uint).with_value("5"))?;
    client.connect().await?;

    assert!(matches!(
        client.remote_value(HR, "Ghost").await,
        Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress))
    ));
    assert_eq!(client.local_value(HR, "Ghost")?, "5");
    assert!(matches!(
        client.remote_value(HR, "Nope").await,
        Err(ModbusError::UnknownEntry(_))
    ));
    server.close();
    Ok(())
}

#[tokio::test]
async fn wrong_function_code_is_improper() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    // answers every request as if it were FC4
    let fake = tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 260];
            while let Ok(n) = sock.read(&mut buf).await {
                if n < 8 {
                    break;
                }
                let tid = u16::from_be_bytes([buf[0], buf[1]]);
                let reply = build_frame(tid, buf[6], &[0x04, 0x04, 0x00, 0x00, 0x00, 0x00]);
                if sock.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });

    let store = RegisterFile::from_str(REGISTERS)?.build_store()?;
    let client = ModbusClient::new(store, ConnectionTarget::direct("127.0.0.1", port))
        .with_timeout(Duration::from_secs(2));
    client.connect().await?;
    assert!(matches!(
        client.remote_value(HR, "MyFloat").await,
        Err(ModbusError::ImproperResponse(_))
    ));
    assert_eq!(client.local_value(HR, "MyFloat")?, "-3.14159");
    client.disconnect();
    fake.abort();
    Ok(())
}

#[tokio::test]
async fn silent_server_times_out() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let silent = tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 260];
            while let Ok(n) = sock.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        }
    });

    let store = RegisterFile::from_str(REGISTERS)?.build_store()?;
    let client = ModbusClient::new(store, ConnectionTarget::direct("127.0.0.1", port))
        .with_timeout(Duration::from_millis(200));
    client.connect().await?;
    assert!(matches!(
        client.remote_value(HR, "Counter").await,
        Err(ModbusError::Timeout)
    ));
    // a timeout does not tear the connection down
    assert!(client.server_available());
    client.disconnect();
    silent.abort();
    Ok(())
}

#[tokio::test]
async fn foreign_transaction_id_is_improper() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    // answers with a transaction id the client never sent
    let fake = tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut req = [0u8; 12];
            while sock.read_exact(&mut req).await.is_ok() {
                let tid = u16::from_be_bytes([req[0], req[1]]).wrapping_add(500);
                let reply = build_frame(tid, req[6], &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
                if sock.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });

    let store = RegisterFile::from_str(REGISTERS)?.build_store()?;
    let client = ModbusClient::new(store, ConnectionTarget::direct("127.0.0.1", port))
        .with_timeout(Duration::from_secs(2));
    client.connect().await?;
    let mut events = client.store().subscribe();
    let res = client.remote_value(HR, "MyFloat").await;
    assert!(matches!(res, Err(ModbusError::ImproperResponse(_))), "{res:?}");
    assert_eq!(client.local_value(HR, "MyFloat")?, "-3.14159");
    assert!(events.try_recv().is_err());
    client.disconnect();
    fake.abort();
    Ok(())
}

#[tokio::test]
async fn abandoned_read_leaves_connection_usable() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let fake = tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let mut req = [0u8; 12];
            let mut served = 0u32;
            while sock.read_exact(&mut req).await.is_ok() {
                served += 1;
                // the first answer arrives after the caller gave up on it
                let low = if served == 1 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    7
                } else {
                    42
                };
                let reply = build_frame(
                    u16::from_be_bytes([req[0], req[1]]),
                    req[6],
                    &[0x03, 0x04, 0x00, low, 0x00, 0x00],
                );
                if sock.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }
    });

    let store = RegisterFile::from_str(REGISTERS)?.build_store()?;
    let client = ModbusClient::new(store, ConnectionTarget::direct("127.0.0.1", port))
        .with_timeout(Duration::from_secs(2));
    client.connect().await?;

    let abandoned = tokio::time::timeout(Duration::from_millis(100), client.remote_value(HR, "Counter")).await;
    assert!(abandoned.is_err());
    // the late answer has no waiter left and is discarded
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.local_value(HR, "Counter")?, "0");
    assert!(client.server_available());

    assert_eq!(client.remote_value(HR, "Counter").await?, "42");
    assert_eq!(client.local_value(HR, "Counter")?, "42");
    client.disconnect();
    fake.abort();
    Ok(())
}

#[tokio::test]
async fn connect_gives_up_after_retries() -> TestResult {
    // bind and release, so nothing listens on the port
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let target = ConnectionTarget::direct("127.0.0.1", port);
    let cfg = Config {
        connect_retry_attempts: 3,
        connect_retry_backoff_ms: 40,
        ..Config::default()
    };

    let started = Instant::now();
    let res = Connection::open_with_retry(&target, &cfg).await;
    assert!(matches!(res, Err(ModbusError::Io(_))), "{res:?}");
    // pauses of 40 ms and 80 ms between the three attempts
    assert!(started.elapsed() >= Duration::from_millis(120));

    let store = RegisterFile::from_str(REGISTERS)?.build_store()?;
    let client = ModbusClient::new(store, target);
    assert!(client.connect().await.is_err());
    assert!(!client.server_available());
    Ok(())
}
