//! Socket table, port allocation, and argument validation.

use super::*;

#[test]
fn default_ports_are_distinct_and_high() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let a = homa.socket().unwrap();
    let b = homa.socket().unwrap();
    assert!(a.port() >= HOMA_MIN_DEFAULT_PORT);
    assert!(b.port() >= HOMA_MIN_DEFAULT_PORT);
    assert_ne!(a.port(), b.port());
}

#[test]
fn bind_validates_port_ranges() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = homa.socket().unwrap();
    let default_port = sock.port();

    /* Port 0 is a no-op; the default port stays. */
    sock.bind(0).unwrap();
    assert_eq!(sock.port(), default_port);

    /* Default-range ports can't be requested explicitly. */
    assert_eq!(sock.bind(HOMA_MIN_DEFAULT_PORT), Err(HomaError::InvalidArg));
    assert_eq!(sock.bind(0x9000), Err(HomaError::InvalidArg));

    sock.bind(100).unwrap();
    assert_eq!(sock.port(), 100);
    /* Rebinding to the same port is fine. */
    sock.bind(100).unwrap();
}

#[test]
fn bind_collision_keeps_existing_port() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let a = homa.socket().unwrap();
    let b = homa.socket().unwrap();
    let b_default = b.port();

    a.bind(100).unwrap();
    assert_eq!(b.bind(100), Err(HomaError::AddrInUse));
    /* B's default port remains valid and reachable. */
    assert_eq!(b.port(), b_default);
}

#[test]
fn client_ids_increase_monotonically() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = ready_socket(&homa, None);
    let mut prev = 0;
    for _ in 0..5 {
        let mut args = SendmsgArgs::default();
        sock.send((TestNet::addr(9), 100).into(), b"ping", &mut args)
            .unwrap();
        assert_eq!(args.id & 1, 0, "client ids are even");
        assert!(args.id > prev);
        prev = args.id;
    }
}

#[test]
fn send_rejects_bad_arguments() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = ready_socket(&homa, None);
    let dest = (TestNet::addr(2), 700).into();

    let mut args = SendmsgArgs::default();
    assert_eq!(sock.send(dest, b"", &mut args), Err(HomaError::InvalidArg));

    let oversize = vec![0u8; HOMA_MAX_MESSAGE_LENGTH + 1];
    assert_eq!(sock.send(dest, &oversize, &mut args), Err(HomaError::InvalidArg));

    let mut bad_flags = SendmsgArgs {
        flags: 0x80,
        ..Default::default()
    };
    assert_eq!(sock.send(dest, b"x", &mut bad_flags), Err(HomaError::InvalidArg));

    /* Port 0 is never a valid destination. */
    let mut args = SendmsgArgs::default();
    assert_eq!(
        sock.send((TestNet::addr(2), 0).into(), b"x", &mut args),
        Err(HomaError::InvalidArg)
    );
}

#[test]
fn recv_requires_buffer_region() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = homa.socket().unwrap();
    let mut args = RecvmsgArgs {
        flags: HOMA_RECVMSG_NONBLOCKING,
        ..Default::default()
    };
    assert_eq!(sock.recv(&mut args), Err(HomaError::InvalidArg));

    /* The region can be installed once, not twice. */
    sock.set_buffer_region(region(4)).unwrap();
    assert_eq!(sock.set_buffer_region(region(4)), Err(HomaError::InvalidArg));
}

#[test]
fn recv_rejects_bogus_returned_buffers() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = ready_socket(&homa, None);
    let mut args = RecvmsgArgs {
        flags: HOMA_RECVMSG_NONBLOCKING,
        bpage_offsets: vec![u32::MAX],
        ..Default::default()
    };
    assert_eq!(sock.recv(&mut args), Err(HomaError::InvalidArg));
}

#[test]
fn poll_reflects_readiness_and_shutdown() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = ready_socket(&homa, None);
    assert_eq!(sock.buffer_region_len(), 64 * HOMA_BPAGE_SIZE);

    /* Fresh socket: send memory available, nothing to read. */
    assert_eq!(sock.poll(), PollEvents::OUT);

    sock.shutdown();
    assert!(sock.poll().contains(PollEvents::IN));
}

#[test]
fn responding_to_a_vanished_rpc_is_a_noop() {
    let net = TestNet::new();
    let homa = net.host(1, HomaConfig::default());
    let sock = ready_socket(&homa, Some(100));
    let mut args = SendmsgArgs {
        id: 12345,
        ..Default::default()
    };
    assert_eq!(
        sock.send((TestNet::addr(2), 700).into(), b"reply", &mut args),
        Ok(())
    );
}
