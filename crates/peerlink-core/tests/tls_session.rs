//! TLS session factory tests.
//!
//! Handshakes run fully in memory: client and server connections exchange
//! records through byte buffers, with the server reading the ClientHello
//! through a rustls `Acceptor` exactly as the transport does.

use std::{collections::HashSet, sync::Arc};

use peerlink_core::{
    NetworkHostAndPort, RevocationConfig, RevocationMode, TransportConfig,
    identity::{select_client_alias, select_server_alias},
    tls::{self, ServerSession},
};
use peerlink_harness::{TestCa, TestIdentity, alice, bob, charlie, config_builder};
use rustls::{
    ClientConnection, Connection,
    client::ClientSessionStore,
    server::{Acceptor, StoresServerSessions},
};

struct Pki {
    ca: TestCa,
    alice: TestIdentity,
    bob: TestIdentity,
    charlie: TestIdentity,
}

fn pki() -> Pki {
    let ca = TestCa::new("Test Root").unwrap();
    let alice = ca.issue(&alice(), 1).unwrap();
    let bob = ca.issue(&bob(), 2).unwrap();
    let charlie = ca.issue(&charlie(), 3).unwrap();
    Pki { ca, alice, bob, charlie }
}

fn target() -> NetworkHostAndPort {
    NetworkHostAndPort::new("localhost", 10000)
}

struct Outcome {
    server: Option<ServerSession>,
    result: Result<(), String>,
    client: ClientConnection,
}

fn move_records(from: &mut Connection, to: &mut Connection) -> Result<(), String> {
    let mut buf = Vec::new();
    while from.wants_write() {
        from.write_tls(&mut buf).map_err(|e| e.to_string())?;
    }
    let mut slice = buf.as_slice();
    while !slice.is_empty() {
        to.read_tls(&mut slice).map_err(|e| e.to_string())?;
        to.process_new_packets().map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn handshake(
    client_config: &TransportConfig,
    server_config: &TransportConfig,
    expected: Option<&HashSet<peerlink_core::LegalName>>,
) -> Outcome {
    let store: Arc<dyn ClientSessionStore> = tls::client_session_cache();
    let cache: Arc<dyn StoresServerSessions> = tls::server_session_cache();

    let session = tls::build_client_session(&target(), expected, client_config, &store).unwrap();
    let mut client =
        ClientConnection::new(Arc::clone(&session.config), session.server_name.clone()).unwrap();

    let mut hello = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut hello).unwrap();
    }
    let mut acceptor = Acceptor::default();
    acceptor.read_tls(&mut hello.as_slice()).unwrap();
    let accepted = acceptor.accept().map_err(|(e, _)| e).unwrap().unwrap();
    let sni = accepted.client_hello().server_name().map(str::to_owned);

    let server_session = tls::build_server_session(server_config, sni.as_deref(), &cache).unwrap();
    let server = match accepted.into_connection(Arc::clone(&server_session.config)) {
        Ok(server) => server,
        Err((e, _)) => {
            return Outcome { server: Some(server_session), result: Err(e.to_string()), client };
        },
    };

    let mut client = Connection::Client(client);
    let mut server = Connection::Server(server);
    let mut result = Ok(());
    for _ in 0..10 {
        if let Err(e) =
            move_records(&mut server, &mut client)
                .and_then(|()| move_records(&mut client, &mut server))
        {
            result = Err(e);
            break;
        }
        if !client.is_handshaking() && !server.is_handshaking() {
            break;
        }
    }

    let Connection::Client(client) = client else { unreachable!() };
    Outcome { server: Some(server_session), result, client }
}

#[test]
fn mutual_handshake_succeeds_with_ignored_host_name() {
    let pki = pki();
    let client = config_builder(&pki.ca, &[&pki.alice]).unwrap().build().unwrap();
    let server = config_builder(&pki.ca, &[&pki.bob]).unwrap().build().unwrap();

    let outcome = handshake(&client, &server, None);
    assert_eq!(outcome.result, Ok(()));
    let peer = outcome.client.peer_certificates().unwrap();
    assert_eq!(&peer[0], pki.bob.leaf());
}

#[test]
fn sni_selects_matching_identity() {
    let pki = pki();
    let client = config_builder(&pki.ca, &[&pki.alice]).unwrap().build().unwrap();
    let server = config_builder(&pki.ca, &[&pki.bob, &pki.charlie]).unwrap().build().unwrap();

    for identity in [&pki.bob, &pki.charlie] {
        let expected = HashSet::from([identity.legal_name.clone()]);
        let outcome = handshake(&client, &server, Some(&expected));
        assert_eq!(outcome.result, Ok(()));
        let selected = outcome.server.unwrap().identity.unwrap();
        assert_eq!(selected.legal_name.as_ref(), Some(&identity.legal_name));
        assert_eq!(&outcome.client.peer_certificates().unwrap()[0], identity.leaf());
    }
}

#[test]
fn sni_without_match_offers_no_certificate() {
    let pki = pki();
    let client = config_builder(&pki.ca, &[&pki.alice]).unwrap().build().unwrap();
    let server = config_builder(&pki.ca, &[&pki.bob, &pki.charlie]).unwrap().build().unwrap();

    let expected = HashSet::from([alice()]);
    let outcome = handshake(&client, &server, Some(&expected));
    assert!(outcome.server.unwrap().identity.is_none());
    assert!(outcome.result.is_err());
}

#[test]
fn sni_disabled_uses_default_alias() {
    let pki = pki();
    let store = peerlink_harness::store_with(&[&pki.bob, &pki.charlie]).unwrap();
    let sni = charlie().sni_host_name();
    assert_eq!(
        select_server_alias(store.as_ref(), Some(&sni), false),
        Some(bob().to_string())
    );
    assert_eq!(select_server_alias(store.as_ref(), Some(&sni), true), Some(charlie().to_string()));
    assert_eq!(select_server_alias(store.as_ref(), None, true), None);
}

#[test]
fn sni_must_match_host_name_exactly() {
    let pki = pki();
    let store = peerlink_harness::store_with(&[&pki.bob, &pki.charlie]).unwrap();
    let sni = charlie().sni_host_name();

    assert_eq!(select_server_alias(store.as_ref(), Some(&sni.to_uppercase()), true), None);
    assert_eq!(select_server_alias(store.as_ref(), Some(&sni[1..]), true), None);
    assert_eq!(select_server_alias(store.as_ref(), Some(&format!("x{sni}")), true), None);
}

#[test]
fn single_alias_ignores_sni() {
    let pki = pki();
    let store = peerlink_harness::store_with(&[&pki.bob]).unwrap();
    assert_eq!(
        select_server_alias(store.as_ref(), Some("nothing.p2p.node"), true),
        Some(bob().to_string())
    );
}

#[test]
fn client_alias_follows_source_name() {
    let pki = pki();
    let store = peerlink_harness::store_with(&[&pki.alice, &pki.charlie]).unwrap();
    assert_eq!(
        select_client_alias(store.as_ref(), Some(&charlie()), true),
        Some(charlie().to_string())
    );
    assert_eq!(select_client_alias(store.as_ref(), Some(&bob()), true), None);
    assert_eq!(select_client_alias(store.as_ref(), None, true), Some(alice().to_string()));
}

#[test]
fn untrusted_server_is_rejected() {
    let pki = pki();
    let other = TestCa::new("Other Root").unwrap();
    let rogue = other.issue(&bob(), 9).unwrap();
    let client = config_builder(&pki.ca, &[&pki.alice]).unwrap().build().unwrap();
    let server = config_builder(&other, &[&rogue]).unwrap().build().unwrap();

    assert!(handshake(&client, &server, None).result.is_err());
}

#[test]
fn soft_fail_rejects_revoked_and_accepts_unlisted() {
    let pki = pki();
    let crl = pki.ca.crl(&[&pki.bob]).unwrap();
    let revocation = || {
        RevocationConfig::new(RevocationMode::SoftFail, None).unwrap().with_crls(vec![crl.clone()])
    };
    let client =
        config_builder(&pki.ca, &[&pki.alice]).unwrap().revocation(revocation()).build().unwrap();

    let revoked = config_builder(&pki.ca, &[&pki.bob]).unwrap().build().unwrap();
    assert!(handshake(&client, &revoked, None).result.is_err());

    let fine = config_builder(&pki.ca, &[&pki.charlie]).unwrap().build().unwrap();
    assert_eq!(handshake(&client, &fine, None).result, Ok(()));
}

#[test]
fn hard_fail_without_crls_rejects_everyone() {
    let pki = pki();
    let client = config_builder(&pki.ca, &[&pki.alice])
        .unwrap()
        .revocation(RevocationConfig::new(RevocationMode::HardFail, None).unwrap())
        .build()
        .unwrap();
    let server = config_builder(&pki.ca, &[&pki.bob]).unwrap().build().unwrap();

    assert!(handshake(&client, &server, None).result.is_err());
}

#[test]
fn hard_fail_with_crl_accepts_unrevoked() {
    let pki = pki();
    let crl = pki.ca.crl(&[&pki.charlie]).unwrap();
    let client = config_builder(&pki.ca, &[&pki.alice])
        .unwrap()
        .revocation(
            RevocationConfig::new(RevocationMode::HardFail, None).unwrap().with_crls(vec![crl]),
        )
        .build()
        .unwrap();
    let server = config_builder(&pki.ca, &[&pki.bob]).unwrap().build().unwrap();

    assert_eq!(handshake(&client, &server, None).result, Ok(()));
}

#[test]
fn server_rejects_revoked_client() {
    let pki = pki();
    let crl = pki.ca.crl(&[&pki.alice]).unwrap();
    let client = config_builder(&pki.ca, &[&pki.alice]).unwrap().build().unwrap();
    let server = config_builder(&pki.ca, &[&pki.bob])
        .unwrap()
        .revocation(
            RevocationConfig::new(RevocationMode::SoftFail, None).unwrap().with_crls(vec![crl]),
        )
        .build()
        .unwrap();

    assert!(handshake(&client, &server, None).result.is_err());
}

#[test]
fn cipher_allow_list_restricts_provider() {
    let pki = pki();
    let config = config_builder(&pki.ca, &[&pki.alice])
        .unwrap()
        .cipher_suites(vec![rustls::CipherSuite::TLS13_AES_256_GCM_SHA384])
        .build()
        .unwrap();
    let provider = tls::crypto_provider(&config).unwrap();
    assert_eq!(provider.cipher_suites.len(), 1);

    let unsupported = config_builder(&pki.ca, &[&pki.alice])
        .unwrap()
        .cipher_suites(vec![rustls::CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA])
        .build()
        .unwrap();
    assert!(tls::crypto_provider(&unsupported).is_err());
}
