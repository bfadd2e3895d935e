use std::{
    io::{Read, Write},
    net::SocketAddr,
    sync::mpsc,
    thread::spawn,
    time::Duration,
};

use criterion::*;
use reactors_coro::{coro::block_on, EventBase, ServerSocket, Socket};

async fn read_exact(conn: &mut Socket, mut buff: &mut [u8]) -> anyhow::Result<()> {
    while !buff.is_empty() {
        let len = conn.read(buff, Duration::from_secs(5)).await?;

        anyhow::ensure!(len != 0, "unexpected eof");

        buff = &mut buff[len..];
    }

    Ok(())
}

async fn echo_server(mut server: ServerSocket) -> anyhow::Result<()> {
    loop {
        let mut conn = server.accept().await?;

        let mut buff = [0u8; 11];

        read_exact(&mut conn, &mut buff).await?;

        assert_eq!(&buff, b"hello world");

        conn.write(&buff, Duration::ZERO, None).await?;
    }
}

fn setup_server() -> SocketAddr {
    let (sender, receiver) = mpsc::channel();

    spawn(move || {
        let evb = EventBase::new().unwrap();

        let server = ServerSocket::bind(&evb, "127.0.0.1:0".parse().unwrap(), 128).unwrap();

        sender.send(server.local_address()).unwrap();

        block_on(&evb, echo_server(server)).unwrap().unwrap();
    });

    receiver.recv().unwrap()
}

async fn client(evb: &EventBase, addr: SocketAddr) -> anyhow::Result<()> {
    let mut conn = Socket::connect(evb, addr, Duration::from_secs(1)).await?;

    conn.write(b"hello world", Duration::ZERO, None).await?;

    let mut buff = [0u8; 11];

    read_exact(&mut conn, &mut buff).await?;

    assert_eq!(&buff, b"hello world");

    Ok(())
}

fn bench_coro(c: &mut Criterion) {
    _ = pretty_env_logger::try_init();

    let addr = setup_server();

    let evb = EventBase::new().unwrap();

    c.bench_function("echo coro", |b| {
        b.iter(|| block_on(&evb, client(&evb, addr)).unwrap().unwrap())
    });
}

fn bench_std(c: &mut Criterion) {
    let addr = setup_server();

    c.bench_function("echo std", |b| {
        b.iter(|| {
            let mut conn = std::net::TcpStream::connect(addr).unwrap();

            conn.write_all(b"hello world").unwrap();

            let mut buff = [0u8; 11];

            conn.read_exact(&mut buff).unwrap();

            assert_eq!(&buff, b"hello world");
        })
    });
}

criterion_group!(benches, bench_coro, bench_std);
criterion_main!(benches);
