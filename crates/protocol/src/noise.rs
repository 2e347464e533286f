//! Noise handshake state machine.
//!
//! This module implements the Noise symmetric state and handshake state for
//! a small set of patterns, generic over the Diffie-Hellman [`Curve`]. The
//! hash is SHA-512 and the cipher ChaCha20-Poly1305, so the full protocol
//! name reads `Noise_XX_Ed25519_ChaChaPoly_SHA512` for the default setup.
//!
//! ## Noise XX Pattern
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! Every `send` call writes exactly one pattern message and every `recv`
//! consumes exactly one. Once the last message is processed the chaining key
//! is split into a transmit and a receive key, the transcript hash is frozen,
//! and all intermediate secrets are dropped. Any failure is terminal.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use hkdf::Hkdf;
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{CipherState, KEY_LENGTH, TAG_LENGTH};
use crate::crypto::{Curve, Ed25519, KeyPair, PUBLIC_KEY_LENGTH};
use crate::error::{ProtocolError, Result};

/// Length of the SHA-512 digest used for the transcript and chaining key.
pub const HASH_LENGTH: usize = 64;

/// Length of a pre-shared key.
pub const PSK_LENGTH: usize = 32;

/// A single handshake token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Mix a pre-shared key.
    Psk,
    /// Ephemeral public key.
    E,
    /// Static public key.
    S,
    /// DH between the initiator's ephemeral and the responder's static.
    Es,
    /// DH between the initiator's static and the responder's ephemeral.
    Se,
    /// DH between both ephemerals.
    Ee,
    /// DH between both statics.
    Ss,
}

/// Supported handshake patterns.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Pattern {
    /// No static keys.
    NN,
    /// `NN` with a pre-shared key mixed before the first message.
    NNpsk0,
    /// Mutual authentication with static keys exchanged in the handshake.
    #[default]
    XX,
    /// `XX` with a pre-shared key mixed before the first message.
    XXpsk0,
    /// The initiator knows the responder's static key beforehand.
    IK,
}

impl Pattern {
    /// Returns the pattern name used in the protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Pattern::NN => "NN",
            Pattern::NNpsk0 => "NNpsk0",
            Pattern::XX => "XX",
            Pattern::XXpsk0 => "XXpsk0",
            Pattern::IK => "IK",
        }
    }

    /// Returns the token sequence, one entry per handshake message.
    pub fn messages(self) -> &'static [&'static [Token]] {
        use Token::*;
        match self {
            Pattern::NN => &[&[E], &[E, Ee]],
            Pattern::NNpsk0 => &[&[Psk, E], &[E, Ee]],
            Pattern::XX => &[&[E], &[E, Ee, S, Es], &[S, Se]],
            Pattern::XXpsk0 => &[&[Psk, E], &[E, Ee, S, Es], &[S, Se]],
            Pattern::IK => &[&[E, Es, S, Ss], &[E, Ee, Se]],
        }
    }

    /// Returns whether the pattern mixes a pre-shared key.
    pub fn uses_psk(self) -> bool {
        matches!(self, Pattern::NNpsk0 | Pattern::XXpsk0)
    }

    /// Returns whether the responder's static key is known before the handshake.
    pub fn has_responder_premessage(self) -> bool {
        matches!(self, Pattern::IK)
    }

    /// Builds the full Noise protocol name for a curve.
    pub fn protocol_name<C: Curve>(self) -> String {
        format!("Noise_{}_{}_ChaChaPoly_SHA512", self.name(), C::NAME)
    }
}

impl FromStr for Pattern {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NN" => Ok(Pattern::NN),
            "NNpsk0" => Ok(Pattern::NNpsk0),
            "XX" => Ok(Pattern::XX),
            "XXpsk0" => Ok(Pattern::XXpsk0),
            "IK" => Ok(Pattern::IK),
            other => Err(ProtocolError::HandshakeFailed(format!(
                "unsupported handshake pattern: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Externally visible progress of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// The next step is to write a message.
    Send,
    /// The next step is to read a message from the peer.
    Recv,
    /// Keys have been derived.
    Complete,
    /// A step failed; the handshake cannot be used again.
    Failed,
}

/// Optional inputs to a handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    /// Data both sides mix into the transcript before the first message.
    pub prologue: Vec<u8>,
    /// The responder's static key, required by the initiator of `IK`.
    pub remote_static: Option<[u8; PUBLIC_KEY_LENGTH]>,
    /// Pre-shared key for `psk` patterns.
    pub psk: Option<[u8; PSK_LENGTH]>,
    /// Fixed ephemeral key pair, otherwise one is generated on first use.
    pub ephemeral: Option<KeyPair>,
}

/// Keys and transcript produced by a completed handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Key for data we send.
    pub tx: [u8; KEY_LENGTH],
    /// Key for data we receive.
    pub rx: [u8; KEY_LENGTH],
    /// Frozen transcript hash.
    pub hash: [u8; HASH_LENGTH],
    /// Our static public key.
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    /// The peer's static public key, if the pattern transmits one.
    pub remote_public_key: Option<[u8; PUBLIC_KEY_LENGTH]>,
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("tx", &"[redacted]")
            .field("rx", &"[redacted]")
            .field("hash", &hex::encode(self.hash))
            .field("public_key", &hex::encode(self.public_key))
            .field("remote_public_key", &self.remote_public_key.map(hex::encode))
            .finish()
    }
}

impl Drop for HandshakeResult {
    fn drop(&mut self) {
        self.tx.zeroize();
        self.rx.zeroize();
    }
}

/// Runs HKDF-SHA512 keyed by the chaining key, producing `N` hash-length outputs.
fn hkdf<const N: usize>(ck: &[u8], ikm: &[u8]) -> Result<Zeroizing<[[u8; HASH_LENGTH]; N]>> {
    let hk = Hkdf::<Sha512>::new(Some(ck), ikm);
    let mut okm = Zeroizing::new(vec![0u8; N * HASH_LENGTH]);
    hk.expand(&[], &mut okm)
        .map_err(|e| ProtocolError::HandshakeFailed(format!("hkdf expand failed: {}", e)))?;

    let mut out = Zeroizing::new([[0u8; HASH_LENGTH]; N]);
    for (slot, chunk) in out.iter_mut().zip(okm.chunks_exact(HASH_LENGTH)) {
        slot.copy_from_slice(chunk);
    }
    Ok(out)
}

fn truncate_key(output: &[u8; HASH_LENGTH]) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&output[..KEY_LENGTH]);
    key
}

/// Chaining key, transcript hash and the handshake-phase cipher.
struct SymmetricState {
    cipher: CipherState,
    ck: Zeroizing<[u8; HASH_LENGTH]>,
    h: [u8; HASH_LENGTH],
}

impl SymmetricState {
    fn new(protocol_name: &[u8]) -> Self {
        let mut h = [0u8; HASH_LENGTH];
        if protocol_name.len() <= HASH_LENGTH {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            h.copy_from_slice(&Sha512::digest(protocol_name));
        }

        Self {
            cipher: CipherState::new(),
            ck: Zeroizing::new(h),
            h,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha512::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    fn mix_key(&mut self, input_key_material: &[u8]) -> Result<()> {
        let [ck, temp_k] = *hkdf::<2>(&self.ck[..], input_key_material)?;
        self.ck.copy_from_slice(&ck);
        self.cipher.initialize_key(truncate_key(&temp_k));
        Ok(())
    }

    fn mix_key_and_hash(&mut self, input_key_material: &[u8]) -> Result<()> {
        let [ck, temp_h, temp_k] = *hkdf::<3>(&self.ck[..], input_key_material)?;
        self.ck.copy_from_slice(&ck);
        self.mix_hash(&temp_h);
        self.cipher.initialize_key(truncate_key(&temp_k));
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt(plaintext, &self.h)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.cipher.decrypt(ciphertext, &self.h)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> Result<([u8; KEY_LENGTH], [u8; KEY_LENGTH])> {
        let [k1, k2] = *hkdf::<2>(&self.ck[..], &[])?;
        Ok((truncate_key(&k1), truncate_key(&k2)))
    }

    fn clear(&mut self) {
        self.cipher.clear();
        self.ck.zeroize();
    }
}

/// A Noise handshake in progress.
///
/// ## Usage
///
/// ```
/// use protocol::noise::{HandshakeOptions, HandshakeState, Pattern};
/// use protocol::crypto::Ed25519;
///
/// let mut initiator =
///     HandshakeState::<Ed25519>::new(Pattern::XX, true, None, HandshakeOptions::default()).unwrap();
/// let mut responder =
///     HandshakeState::<Ed25519>::new(Pattern::XX, false, None, HandshakeOptions::default()).unwrap();
///
/// let msg1 = initiator.send(&[]).unwrap();
/// responder.recv(&msg1).unwrap();
/// let msg2 = responder.send(&[]).unwrap();
/// initiator.recv(&msg2).unwrap();
/// let msg3 = initiator.send(&[]).unwrap();
/// responder.recv(&msg3).unwrap();
///
/// let a = initiator.result().unwrap();
/// let b = responder.result().unwrap();
/// assert_eq!(a.tx, b.rx);
/// assert_eq!(a.hash, b.hash);
/// ```
pub struct HandshakeState<C: Curve = Ed25519> {
    pattern: Pattern,
    initiator: bool,
    symmetric: SymmetricState,
    s: KeyPair,
    e: Option<KeyPair>,
    rs: Option<[u8; PUBLIC_KEY_LENGTH]>,
    re: Option<[u8; PUBLIC_KEY_LENGTH]>,
    psk: Option<Zeroizing<[u8; PSK_LENGTH]>>,
    step: usize,
    result: Option<HandshakeResult>,
    failed: bool,
    _curve: PhantomData<C>,
}

impl<C: Curve> HandshakeState<C> {
    /// Initialises a handshake.
    ///
    /// A static key pair is generated when none is supplied.
    pub fn new(
        pattern: Pattern,
        initiator: bool,
        static_keypair: Option<KeyPair>,
        options: HandshakeOptions,
    ) -> Result<Self> {
        if pattern.uses_psk() && options.psk.is_none() {
            return Err(ProtocolError::HandshakeFailed(format!(
                "pattern {} requires a pre-shared key",
                pattern
            )));
        }

        let mut symmetric = SymmetricState::new(pattern.protocol_name::<C>().as_bytes());
        symmetric.mix_hash(&options.prologue);

        let s = static_keypair.unwrap_or_else(C::generate_keypair);
        let mut rs = None;
        if pattern.has_responder_premessage() {
            if initiator {
                let key = options.remote_static.ok_or_else(|| {
                    ProtocolError::HandshakeFailed(format!(
                        "pattern {} requires the remote static key",
                        pattern
                    ))
                })?;
                symmetric.mix_hash(&key);
                rs = Some(key);
            } else {
                symmetric.mix_hash(s.public_key());
            }
        }

        Ok(Self {
            pattern,
            initiator,
            symmetric,
            s,
            e: options.ephemeral,
            rs,
            re: None,
            psk: options.psk.map(Zeroizing::new),
            step: 0,
            result: None,
            failed: false,
            _curve: PhantomData,
        })
    }

    /// Returns the pattern being run.
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Returns whether this side initiated the handshake.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Returns the current phase.
    pub fn phase(&self) -> HandshakePhase {
        if self.failed {
            HandshakePhase::Failed
        } else if self.result.is_some() {
            HandshakePhase::Complete
        } else if (self.step % 2 == 0) == self.initiator {
            HandshakePhase::Send
        } else {
            HandshakePhase::Recv
        }
    }

    /// Returns whether keys have been derived.
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    /// Returns our static key pair.
    pub fn local_static(&self) -> &KeyPair {
        &self.s
    }

    /// Returns the peer's static key once known.
    pub fn remote_static(&self) -> Option<&[u8; PUBLIC_KEY_LENGTH]> {
        self.rs.as_ref()
    }

    /// Returns the current transcript hash.
    pub fn handshake_hash(&self) -> &[u8; HASH_LENGTH] {
        &self.symmetric.h
    }

    /// Returns the derived keys once the handshake is complete.
    pub fn result(&self) -> Option<&HandshakeResult> {
        self.result.as_ref()
    }

    /// Takes the derived keys out of the handshake.
    pub fn take_result(&mut self) -> Option<HandshakeResult> {
        self.result.take()
    }

    /// Writes the next handshake message carrying `payload`.
    pub fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.expect_phase(HandshakePhase::Send)?;
        self.write_message(payload).map_err(|err| self.fail(err))
    }

    /// Reads the next handshake message and returns its payload.
    pub fn recv(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.expect_phase(HandshakePhase::Recv)?;
        self.read_message(message).map_err(|err| self.fail(err))
    }

    fn expect_phase(&mut self, expected: HandshakePhase) -> Result<()> {
        match self.phase() {
            HandshakePhase::Failed => Err(ProtocolError::HandshakeTerminated),
            HandshakePhase::Complete => Err(ProtocolError::HandshakeFailed(
                "handshake already complete".into(),
            )),
            phase if phase == expected => Ok(()),
            phase => Err(self.fail(ProtocolError::HandshakeFailed(format!(
                "cannot {:?} while in phase {:?}",
                expected, phase
            )))),
        }
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        for &token in self.pattern.messages()[self.step] {
            match token {
                Token::E => {
                    let e = self.e.take().unwrap_or_else(C::generate_keypair);
                    message.extend_from_slice(e.public_key());
                    self.mix_ephemeral(e.public_key())?;
                    self.e = Some(e);
                }
                Token::S => {
                    let public_key = *self.s.public_key();
                    message.extend(self.symmetric.encrypt_and_hash(&public_key)?);
                }
                Token::Psk => self.mix_psk()?,
                dh => self.mix_dh(dh)?,
            }
        }
        message.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.advance()?;
        Ok(message)
    }

    fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let mut rest = message;
        for &token in self.pattern.messages()[self.step] {
            match token {
                Token::E => {
                    let re: [u8; PUBLIC_KEY_LENGTH] = take(&mut rest, PUBLIC_KEY_LENGTH)?
                        .try_into()
                        .map_err(|_| short_message())?;
                    self.mix_ephemeral(&re)?;
                    self.re = Some(re);
                }
                Token::S => {
                    let len = if self.symmetric.cipher.has_key() {
                        PUBLIC_KEY_LENGTH + TAG_LENGTH
                    } else {
                        PUBLIC_KEY_LENGTH
                    };
                    let chunk = take(&mut rest, len)?;
                    let rs: [u8; PUBLIC_KEY_LENGTH] = self
                        .symmetric
                        .decrypt_and_hash(chunk)?
                        .try_into()
                        .map_err(|_| short_message())?;
                    self.rs = Some(rs);
                }
                Token::Psk => self.mix_psk()?,
                dh => self.mix_dh(dh)?,
            }
        }
        let payload = self.symmetric.decrypt_and_hash(rest)?;
        self.advance()?;
        Ok(payload)
    }

    fn mix_ephemeral(&mut self, public_key: &[u8; PUBLIC_KEY_LENGTH]) -> Result<()> {
        self.symmetric.mix_hash(public_key);
        if self.pattern.uses_psk() {
            self.symmetric.mix_key(public_key)?;
        }
        Ok(())
    }

    fn mix_psk(&mut self) -> Result<()> {
        let psk = self
            .psk
            .as_ref()
            .ok_or_else(|| ProtocolError::HandshakeFailed("missing pre-shared key".into()))?;
        let psk = Zeroizing::new(**psk);
        self.symmetric.mix_key_and_hash(&psk[..])
    }

    fn mix_dh(&mut self, token: Token) -> Result<()> {
        let (local_static, remote_static) = match token {
            Token::Ee => (false, false),
            Token::Es => (!self.initiator, self.initiator),
            Token::Se => (self.initiator, !self.initiator),
            Token::Ss => (true, true),
            other => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "token {:?} is not a DH token",
                    other
                )))
            }
        };

        let local = if local_static {
            &self.s
        } else {
            self.e
                .as_ref()
                .ok_or_else(|| ProtocolError::HandshakeFailed("missing local ephemeral".into()))?
        };
        let remote = (if remote_static { self.rs } else { self.re })
            .ok_or_else(|| ProtocolError::HandshakeFailed("missing remote key".into()))?;

        let mut shared = C::dh(local, &remote)?;
        let mixed = self.symmetric.mix_key(&shared);
        shared.zeroize();
        mixed
    }

    fn advance(&mut self) -> Result<()> {
        self.step += 1;
        if self.step < self.pattern.messages().len() {
            return Ok(());
        }

        let (k1, k2) = self.symmetric.split()?;
        let (tx, rx) = if self.initiator { (k1, k2) } else { (k2, k1) };
        self.result = Some(HandshakeResult {
            tx,
            rx,
            hash: self.symmetric.h,
            public_key: *self.s.public_key(),
            remote_public_key: self.rs,
        });

        self.e = None;
        self.re = None;
        self.psk = None;
        self.symmetric.clear();
        tracing::trace!(pattern = %self.pattern, initiator = self.initiator, "noise handshake complete");
        Ok(())
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        self.failed = true;
        self.e = None;
        self.re = None;
        self.psk = None;
        self.result = None;
        self.symmetric.clear();
        match err {
            ProtocolError::HandshakeFailed(_) | ProtocolError::HandshakeTerminated => err,
            other => ProtocolError::HandshakeFailed(other.to_string()),
        }
    }
}

impl<C: Curve> fmt::Debug for HandshakeState<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("pattern", &self.pattern)
            .field("initiator", &self.initiator)
            .field("phase", &self.phase())
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

fn take<'a>(rest: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if rest.len() < len {
        return Err(short_message());
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

fn short_message() -> ProtocolError {
    ProtocolError::HandshakeFailed("handshake message too short".into())
}
