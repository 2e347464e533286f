//! Interoperability of the handshake state machine with `snow`.
//!
//! Run over X25519 so both implementations use the same curve; the
//! transcript hash and transport keys must agree byte for byte.

use protocol::crypto::{Curve, X25519};
use protocol::noise::{HandshakeOptions, HandshakeResult, HandshakeState, Pattern};
use protocol::CipherState;

const PSK: [u8; 32] = [0x42; 32];

fn params(pattern: Pattern) -> snow::params::NoiseParams {
    pattern.protocol_name::<X25519>().parse().unwrap()
}

/// Checks that transport keys line up in both directions.
fn assert_transport(result: &HandshakeResult, mut remote: snow::TransportState) {
    let mut buf = vec![0u8; 1024];

    let mut tx = CipherState::with_key(result.tx);
    let ciphertext = tx.encrypt(b"ping", &[]).unwrap();
    let len = remote.read_message(&ciphertext, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"ping");

    let mut out = vec![0u8; 1024];
    let len = remote.write_message(b"pong", &mut out).unwrap();
    let mut rx = CipherState::with_key(result.rx);
    assert_eq!(rx.decrypt(&out[..len], &[]).unwrap(), b"pong");
}

fn run_as_initiator(pattern: Pattern) {
    let builder = snow::Builder::new(params(pattern));
    let responder_keys = builder.generate_keypair().unwrap();
    let mut builder = snow::Builder::new(params(pattern)).local_private_key(&responder_keys.private);
    if pattern.uses_psk() {
        builder = builder.psk(0, &PSK);
    }
    let mut snow_responder = builder.build_responder().unwrap();

    let mut remote_static = None;
    if pattern.has_responder_premessage() {
        let mut key = [0u8; 32];
        key.copy_from_slice(&responder_keys.public);
        remote_static = Some(key);
    }
    let options = HandshakeOptions {
        remote_static,
        psk: pattern.uses_psk().then_some(PSK),
        ..Default::default()
    };
    let local = X25519::generate_keypair();
    let local_public = *local.public_key();
    let mut ours = HandshakeState::<X25519>::new(pattern, true, Some(local), options).unwrap();

    let mut buf = vec![0u8; 65535];
    let mut our_turn = true;
    while !ours.is_complete() || !snow_responder.is_handshake_finished() {
        if our_turn {
            let message = ours.send(b"").unwrap();
            snow_responder.read_message(&message, &mut buf).unwrap();
        } else {
            let len = snow_responder.write_message(&[], &mut buf).unwrap();
            ours.recv(&buf[..len]).unwrap();
        }
        our_turn = !our_turn;
    }

    let result = ours.take_result().unwrap();
    assert_eq!(&result.hash[..], snow_responder.get_handshake_hash());
    if pattern != Pattern::NN && pattern != Pattern::NNpsk0 {
        assert_eq!(snow_responder.get_remote_static().unwrap(), &local_public[..]);
        assert_eq!(
            result.remote_public_key.map(|k| k.to_vec()),
            Some(responder_keys.public.clone())
        );
    }
    assert_transport(&result, snow_responder.into_transport_mode().unwrap());
}

fn run_as_responder(pattern: Pattern) {
    let local = X25519::generate_keypair();
    let local_public = *local.public_key();

    let mut builder = snow::Builder::new(params(pattern));
    let initiator_keys = builder.generate_keypair().unwrap();
    builder = builder.local_private_key(&initiator_keys.private);
    if pattern.has_responder_premessage() {
        builder = builder.remote_public_key(&local_public);
    }
    if pattern.uses_psk() {
        builder = builder.psk(0, &PSK);
    }
    let mut snow_initiator = builder.build_initiator().unwrap();

    let options = HandshakeOptions {
        psk: pattern.uses_psk().then_some(PSK),
        ..Default::default()
    };
    let mut ours = HandshakeState::<X25519>::new(pattern, false, Some(local), options).unwrap();

    let mut buf = vec![0u8; 65535];
    let mut our_turn = false;
    while !ours.is_complete() || !snow_initiator.is_handshake_finished() {
        if our_turn {
            let message = ours.send(b"").unwrap();
            snow_initiator.read_message(&message, &mut buf).unwrap();
        } else {
            let len = snow_initiator.write_message(&[], &mut buf).unwrap();
            ours.recv(&buf[..len]).unwrap();
        }
        our_turn = !our_turn;
    }

    let result = ours.take_result().unwrap();
    assert_eq!(&result.hash[..], snow_initiator.get_handshake_hash());
    assert_transport(&result, snow_initiator.into_transport_mode().unwrap());
}

#[test]
fn test_xx_initiator_against_snow() {
    run_as_initiator(Pattern::XX);
}

#[test]
fn test_xx_responder_against_snow() {
    run_as_responder(Pattern::XX);
}

#[test]
fn test_nn_against_snow() {
    run_as_initiator(Pattern::NN);
    run_as_responder(Pattern::NN);
}

#[test]
fn test_psk_patterns_against_snow() {
    run_as_initiator(Pattern::NNpsk0);
    run_as_initiator(Pattern::XXpsk0);
    run_as_responder(Pattern::XXpsk0);
}

#[test]
fn test_ik_against_snow() {
    run_as_initiator(Pattern::IK);
    run_as_responder(Pattern::IK);
}

#[test]
fn test_payload_reaches_snow() {
    let pattern = Pattern::XX;
    let mut snow_responder = snow::Builder::new(params(pattern))
        .local_private_key(&[7u8; 32])
        .build_responder()
        .unwrap();
    let mut ours =
        HandshakeState::<X25519>::new(pattern, true, None, HandshakeOptions::default()).unwrap();

    let mut buf = vec![0u8; 1024];
    let message = ours.send(b"early").unwrap();
    let len = snow_responder.read_message(&message, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"early");
}
