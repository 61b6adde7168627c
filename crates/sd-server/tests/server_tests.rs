//! End-to-end tests: a real server on real sockets, driven through the
//! client library.

use std::net::IpAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use sd_client::{props, Client, ConnectOpts, MatchType};
use sd_engine::Limits;
use sd_server::config::{Conf, DomainConf, IdleLimit, ProtoRange, ResourcesConf, SocketConf};
use sd_server::Server;

fn tcp_domain() -> DomainConf {
	DomainConf {
		name: None,
		sockets: vec![SocketConf {
			addr: "tcp:127.0.0.1:0".parse().unwrap(),
			tls: None,
		}],
		proto: ProtoRange::default(),
		idle: IdleLimit::default(),
	}
}

async fn start(domains: Vec<DomainConf>, resources: ResourcesConf) -> (Server, String) {
	let mut conf = Conf {
		domains,
		resources,
		..Conf::default()
	};
	conf.log.console = false;
	let server = Server::bind(&conf).await.expect("bind");
	let addr = server.local_addrs(0)[0].clone();
	(server, addr)
}

async fn start_default() -> (Server, String) {
	start(vec![tcp_domain()], ResourcesConf::default()).await
}

fn name_props(name: &str) -> sd_client::Props {
	props(&[("name", &[name.into()])])
}

#[tokio::test]
async fn handshake_version_mismatch_is_rejected() {
	let (_server, addr) = start_default().await;

	let err = Client::connect_with(
		&addr,
		ConnectOpts {
			proto_min: Some(99),
			proto_max: Some(100),
			..ConnectOpts::default()
		},
	)
	.await
	.expect_err("handshake should fail");
	assert_eq!(err.fail_reason(), Some("unsupported-protocol-version"));
}

#[tokio::test]
async fn handshake_negotiates_highest_version() {
	let (_server, addr) = start_default().await;

	let conn = Client::connect(&addr).await.unwrap();
	assert_eq!(conn.proto_version(), 3);

	let conn = Client::connect_with(
		&addr,
		ConnectOpts {
			proto_max: Some(2),
			..ConnectOpts::default()
		},
	)
	.await
	.unwrap();
	assert_eq!(conn.proto_version(), 2);
}

#[tokio::test]
async fn v2_only_domain_rejects_v3_clients() {
	let mut domain = tcp_domain();
	domain.proto = ProtoRange { min: 2, max: 2 };
	let (_server, addr) = start(vec![domain], ResourcesConf::default()).await;

	let conn = Client::connect(&addr).await.unwrap();
	assert_eq!(conn.proto_version(), 2);

	let err = Client::connect_with(
		&addr,
		ConnectOpts {
			proto_min: Some(3),
			..ConnectOpts::default()
		},
	)
	.await
	.expect_err("v3-only client on v2-only domain");
	assert_eq!(err.fail_reason(), Some("unsupported-protocol-version"));
}

#[tokio::test]
async fn publish_then_subscribe_replays_service() {
	let (_server, addr) = start_default().await;

	let mut publisher = Client::connect(&addr).await.unwrap();
	publisher.publish(42, 1, &name_props("x"), 10).await.unwrap();

	let mut subscriber = Client::connect(&addr).await.unwrap();
	let mut sub = subscriber.subscribe(17, Some("(name=x)")).await.unwrap();

	let event = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(event.match_type, MatchType::Appeared);
	assert_eq!(event.service_id, 42);
	assert_eq!(event.generation, Some(1));
	assert_eq!(event.props.as_ref(), Some(&name_props("x")));
	assert_eq!(event.ttl, Some(10));
	assert_eq!(event.client_id, Some(publisher.client_id()));
	assert_eq!(event.orphan_since, None);

	// nothing else is owed
	assert!(sub.quiet_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn non_matching_services_are_not_replayed() {
	let (_server, addr) = start_default().await;

	let mut publisher = Client::connect(&addr).await.unwrap();
	publisher.publish(1, 1, &name_props("other"), 10).await.unwrap();

	let mut subscriber = Client::connect(&addr).await.unwrap();
	let mut sub = subscriber.subscribe(17, Some("(name=x)")).await.unwrap();
	assert!(sub.quiet_for(Duration::from_millis(300)).await);

	publisher.publish(2, 1, &name_props("x"), 10).await.unwrap();
	let event = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(event.service_id, 2);
}

#[tokio::test]
async fn unpublish_by_other_user_is_denied() {
	let (_server, addr) = start_default().await;

	// distinct loopback source addresses give distinct ip: user ids
	let mut owner = Client::connect_with(
		&addr,
		ConnectOpts {
			local_ip: Some("127.0.0.1".parse::<IpAddr>().unwrap()),
			..ConnectOpts::default()
		},
	)
	.await
	.unwrap();
	let mut other = Client::connect_with(
		&addr,
		ConnectOpts {
			local_ip: Some("127.0.0.2".parse::<IpAddr>().unwrap()),
			..ConnectOpts::default()
		},
	)
	.await
	.unwrap();

	owner.publish(1, 0, &name_props("x"), 42).await.unwrap();

	let err = other.unpublish(1).await.expect_err("unpublish by other user");
	assert_eq!(err.fail_reason(), Some("permission-denied"));

	owner.unpublish(1).await.unwrap();
}

#[tokio::test]
async fn unpublish_by_same_user_other_client_succeeds() {
	let (_server, addr) = start_default().await;

	let mut owner = Client::connect(&addr).await.unwrap();
	owner.publish(1, 0, &name_props("x"), 42).await.unwrap();

	let mut other = Client::connect(&addr).await.unwrap();
	other.unpublish(1).await.unwrap();

	assert!(owner.services(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn generation_rules() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let mut sub_conn = Client::connect(&addr).await.unwrap();

	conn.publish(7, 11, &name_props("x"), 42).await.unwrap();
	let mut sub = sub_conn.subscribe(17, None).await.unwrap();
	sub.next_within(Duration::from_secs(2)).await.unwrap();

	// identical republish: idempotent, no notification
	conn.publish(7, 11, &name_props("x"), 42).await.unwrap();

	let err = conn.publish(7, 10, &name_props("x"), 42).await.expect_err("old generation");
	assert_eq!(err.fail_reason(), Some("old-generation"));

	let err = conn.publish(7, 11, &name_props("y"), 42).await.expect_err("different props");
	assert_eq!(err.fail_reason(), Some("same-generation-but-different"));

	let err = conn.publish(7, 11, &name_props("x"), 41).await.expect_err("different ttl");
	assert_eq!(err.fail_reason(), Some("same-generation-but-different"));

	// none of the failures may have produced notifications
	assert!(sub.quiet_for(Duration::from_millis(300)).await);

	// a higher generation goes through
	conn.publish(7, 12, &name_props("y"), 42).await.unwrap();
	let event = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(event.match_type, MatchType::Modified);
	assert_eq!(event.generation, Some(12));
}

#[tokio::test]
async fn orphan_lifecycle_expiry() {
	let (_server, addr) = start_default().await;

	let mut publisher = Client::connect(&addr).await.unwrap();
	publisher.publish(42, 1, &name_props("x"), 1).await.unwrap();

	let mut sub_conn = Client::connect(&addr).await.unwrap();
	let mut sub = sub_conn.subscribe(17, None).await.unwrap();
	let appeared = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(appeared.match_type, MatchType::Appeared);

	drop(publisher);

	let orphaned = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(orphaned.match_type, MatchType::Modified);
	assert_eq!(orphaned.service_id, 42);
	assert!(orphaned.orphan_since.is_some());

	// ttl is 1 s; the orphan must disappear shortly after
	let disappeared = sub.next_within(Duration::from_secs(3)).await.unwrap();
	assert_eq!(disappeared.match_type, MatchType::Disappeared);
	assert_eq!(disappeared.service_id, 42);
	assert_eq!(disappeared.generation, None);

	assert!(sub_conn.services(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn orphan_reclaim_with_higher_generation() {
	let (_server, addr) = start_default().await;

	let mut first = Client::connect(&addr).await.unwrap();
	first.publish(1, 5, &props(&[("a", &[1.into()])]), 4).await.unwrap();

	let mut sub_conn = Client::connect(&addr).await.unwrap();
	let mut sub = sub_conn.subscribe(17, None).await.unwrap();
	let appeared = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(appeared.generation, Some(5));

	drop(first);
	let orphaned = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert!(orphaned.orphan_since.is_some());

	let mut second = Client::connect(&addr).await.unwrap();
	second.publish(1, 6, &props(&[("a", &[2.into()])]), 4).await.unwrap();

	let reclaimed = sub.next_within(Duration::from_secs(2)).await.unwrap();
	assert_eq!(reclaimed.match_type, MatchType::Modified);
	assert_eq!(reclaimed.generation, Some(6));
	assert_eq!(reclaimed.client_id, Some(second.client_id()));
	assert_eq!(reclaimed.orphan_since, None);

	// reclaimed services no longer time out
	assert!(sub.quiet_for(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn unsubscribe_completes_both_transactions() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let mut sub = conn.subscribe(17, None).await.unwrap();

	conn.unsubscribe(17).await.unwrap();
	// the subscription's own transaction completes
	assert!(sub.next().await.unwrap().is_none());

	let err = conn.unsubscribe(17).await.expect_err("already removed");
	assert_eq!(err.fail_reason(), Some("non-existent-subscription-id"));
}

#[tokio::test]
async fn subscription_id_collision_is_rejected() {
	let (_server, addr) = start_default().await;

	let mut a = Client::connect(&addr).await.unwrap();
	let _sub = a.subscribe(17, None).await.unwrap();

	let mut b = Client::connect(&addr).await.unwrap();
	let err = b.subscribe(17, None).await.expect_err("id in use");
	assert_eq!(err.fail_reason(), Some("subscription-id-exists"));
}

#[tokio::test]
async fn malformed_filter_is_rejected() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let err = conn.subscribe(17, Some("(key=)")).await.expect_err("bad filter");
	assert_eq!(err.fail_reason(), Some("invalid-filter-syntax"));

	let err = conn.services(Some("(((")).await.expect_err("bad filter");
	assert_eq!(err.fail_reason(), Some("invalid-filter-syntax"));
}

#[tokio::test]
async fn service_resource_exhaustion() {
	let resources = ResourcesConf {
		user: Limits {
			services: Some(3),
			..Limits::default()
		},
		total: Limits::default(),
	};
	let (_server, addr) = start(vec![tcp_domain()], resources).await;

	let mut conn = Client::connect(&addr).await.unwrap();
	for id in 0..3 {
		conn.publish(id, 0, &name_props("x"), 10).await.unwrap();
	}
	let err = conn.publish(3, 0, &name_props("x"), 10).await.expect_err("over the limit");
	assert_eq!(err.fail_reason(), Some("insufficient-resources"));

	conn.unpublish(0).await.unwrap();
	conn.publish(3, 0, &name_props("x"), 10).await.unwrap();
}

#[tokio::test]
async fn client_id_collision_is_rejected() {
	let (_server, addr) = start_default().await;

	let client_id = sd_client::allocate_client_id();
	let mut first = Client::connect_with(
		&addr,
		ConnectOpts {
			client_id: Some(client_id),
			..ConnectOpts::default()
		},
	)
	.await
	.unwrap();

	let err = Client::connect_with(
		&addr,
		ConnectOpts {
			client_id: Some(client_id),
			..ConnectOpts::default()
		},
	)
	.await
	.expect_err("client id in use");
	assert_eq!(err.fail_reason(), Some("client-id-exists"));

	// the existing connection is unaffected
	first.ping().await.unwrap();
}

#[tokio::test]
async fn services_listing_with_filter() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	conn.publish(1, 1, &name_props("a"), 10).await.unwrap();
	conn.publish(2, 1, &name_props("b"), 10).await.unwrap();

	let all = conn.services(None).await.unwrap();
	assert_eq!(all.len(), 2);

	let only_a = conn.services(Some("(name=a)")).await.unwrap();
	assert_eq!(only_a.len(), 1);
	assert_eq!(only_a[0].service_id, 1);
	assert_eq!(only_a[0].client_id, conn.client_id());
	assert_eq!(only_a[0].orphan_since, None);
}

#[tokio::test]
async fn subscriptions_listing() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let _sub = conn.subscribe(17, Some("(name=x)")).await.unwrap();

	let subs = conn.subscriptions().await.unwrap();
	assert_eq!(subs.len(), 1);
	assert_eq!(subs[0].subscription_id, 17);
	assert_eq!(subs[0].client_id, conn.client_id());
	assert_eq!(subs[0].filter.as_deref(), Some("(name=x)"));
}

#[tokio::test]
async fn clients_listing_versioned_fields() {
	let (_server, addr) = start_default().await;

	let mut v3_conn = Client::connect(&addr).await.unwrap();
	let mut v2_conn = Client::connect_with(
		&addr,
		ConnectOpts {
			proto_max: Some(2),
			..ConnectOpts::default()
		},
	)
	.await
	.unwrap();

	let seen_by_v3 = v3_conn.clients().await.unwrap();
	assert_eq!(seen_by_v3.len(), 2);
	for client in &seen_by_v3 {
		assert!(client.idle.is_some());
		assert!(client.proto_version.is_some());
		assert!(client.client_address.starts_with("tcp:"));
	}
	let v2_row = seen_by_v3.iter().find(|c| c.client_id == v2_conn.client_id()).unwrap();
	assert_eq!(v2_row.proto_version, Some(2));

	// v2 viewers never see v3 fields
	let seen_by_v2 = v2_conn.clients().await.unwrap();
	assert_eq!(seen_by_v2.len(), 2);
	for client in &seen_by_v2 {
		assert_eq!(client.idle, None);
		assert_eq!(client.proto_version, None);
		assert_eq!(client.latency, None);
	}
}

#[tokio::test]
async fn track_keep_alive_round_trip() {
	let mut domain = tcp_domain();
	domain.idle = IdleLimit { min: 1, max: 2 };
	let (_server, addr) = start(vec![domain], ResourcesConf::default()).await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let mut track = conn.track().await.unwrap();

	// max-idle 2 s: a query should arrive around the 1 s mark
	let query = tokio::time::timeout(Duration::from_millis(2500), track.next_notify())
		.await
		.expect("expected a track query")
		.unwrap();
	assert_eq!(query, sd_client::TrackType::Query);
	track.reply();

	// replying keeps the connection open through the next cycle
	let query = tokio::time::timeout(Duration::from_millis(2500), track.next_notify())
		.await
		.expect("expected another track query")
		.unwrap();
	assert_eq!(query, sd_client::TrackType::Query);
	track.reply();

	conn.ping().await.unwrap();
}

#[tokio::test]
async fn unanswered_track_query_closes_the_connection() {
	let mut domain = tcp_domain();
	domain.idle = IdleLimit { min: 1, max: 2 };
	let (_server, addr) = start(vec![domain], ResourcesConf::default()).await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let mut track = conn.track().await.unwrap();

	let query = tokio::time::timeout(Duration::from_millis(2500), track.next_notify())
		.await
		.expect("expected a track query")
		.unwrap();
	assert_eq!(query, sd_client::TrackType::Query);

	// withhold the reply; the server must give up within the second
	// half of the idle window
	let result = tokio::time::timeout(Duration::from_millis(2500), track.next_notify()).await;
	match result {
		Ok(Err(_)) => {}
		Ok(Ok(other)) => panic!("expected connection closure, got {other:?}"),
		Err(_) => panic!("connection not closed after unanswered query"),
	}
}

#[tokio::test]
async fn client_probes_server_liveness() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let mut track = conn.track().await.unwrap();

	track.query();
	let reply = tokio::time::timeout(Duration::from_secs(2), track.next_notify())
		.await
		.expect("expected a track reply")
		.unwrap();
	assert_eq!(reply, sd_client::TrackType::Reply);
}

#[tokio::test]
async fn second_track_transaction_is_rejected() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let _track = conn.track().await.unwrap();
	let err = conn.track().await.expect_err("one track per connection");
	assert_eq!(err.fail_reason(), Some("track-exists"));
}

#[tokio::test]
async fn request_before_hello_fails() {
	let (_server, addr) = start_default().await;

	let host_port = addr.strip_prefix("tcp:").unwrap();
	let stream = tokio::net::TcpStream::connect(host_port).await.unwrap();
	let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

	let ping = serde_json::json!({"ta-cmd": "ping", "ta-id": 1, "msg-type": "request"});
	framed.send(serde_json::to_vec(&ping).unwrap().into()).await.unwrap();

	let frame = tokio::time::timeout(Duration::from_secs(2), framed.next())
		.await
		.expect("expected a reply")
		.unwrap()
		.unwrap();
	let reply: serde_json::Value = serde_json::from_slice(&frame).unwrap();
	assert_eq!(reply["msg-type"], "fail");
	assert_eq!(reply["fail-reason"], "no-hello");
	assert_eq!(reply["ta-id"], 1);
}

#[tokio::test]
async fn handshake_deadline_is_enforced() {
	let (_server, addr) = start_default().await;

	let host_port = addr.strip_prefix("tcp:").unwrap();
	let stream = tokio::net::TcpStream::connect(host_port).await.unwrap();
	let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

	// no hello: the janitor should close us within deadline + sweep
	let eof = tokio::time::timeout(Duration::from_secs(5), framed.next()).await.expect("expected closure");
	assert!(eof.is_none() || eof.unwrap().is_err());
}

#[tokio::test]
async fn multi_socket_domain_shares_state() {
	let mut domain = tcp_domain();
	domain.sockets.push(SocketConf {
		addr: "tcp:127.0.0.1:0".parse().unwrap(),
		tls: None,
	});
	let (server, addr0) = start(vec![domain], ResourcesConf::default()).await;
	let addr1 = server.local_addrs(0)[1].clone();
	assert_ne!(addr0, addr1);

	let mut on_first = Client::connect(&addr0).await.unwrap();
	on_first.publish(1, 1, &name_props("x"), 10).await.unwrap();

	let mut on_second = Client::connect(&addr1).await.unwrap();
	let services = on_second.services(None).await.unwrap();
	assert_eq!(services.len(), 1);
}

#[tokio::test]
async fn domains_are_isolated() {
	let (server, addr0) = start(vec![tcp_domain(), tcp_domain()], ResourcesConf::default()).await;
	let addr1 = server.local_addrs(1)[0].clone();

	let mut in_first = Client::connect(&addr0).await.unwrap();
	in_first.publish(1, 1, &name_props("x"), 10).await.unwrap();

	let mut in_second = Client::connect(&addr1).await.unwrap();
	assert!(in_second.services(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn client_admission_limit_pauses_accept() {
	let resources = ResourcesConf {
		user: Limits::default(),
		total: Limits {
			clients: Some(1),
			..Limits::default()
		},
	};
	let (_server, addr) = start(vec![tcp_domain()], resources).await;

	let mut first = Client::connect(&addr).await.unwrap();
	first.ping().await.unwrap();

	// a second client cannot get through while the first is connected
	let second = tokio::time::timeout(Duration::from_millis(800), Client::connect(&addr)).await;
	assert!(second.is_err() || second.unwrap().is_err());

	drop(first);
	// accept resumes after the slot frees up; allow a moment for the
	// server to notice the disconnect
	tokio::time::sleep(Duration::from_millis(200)).await;
	let mut third = Client::connect(&addr).await.unwrap();
	third.ping().await.unwrap();
}

#[tokio::test]
async fn unix_domain_sockets_work_end_to_end() {
	let domain = DomainConf {
		name: Some("local".to_owned()),
		sockets: vec![SocketConf {
			addr: format!("ux:sd-test-{}", std::process::id()).parse().unwrap(),
			tls: None,
		}],
		proto: ProtoRange::default(),
		idle: IdleLimit::default(),
	};
	let (_server, addr) = start(vec![domain], ResourcesConf::default()).await;
	assert!(addr.starts_with("ux:"));

	let mut conn = Client::connect(&addr).await.unwrap();
	conn.publish(1, 1, &name_props("x"), 10).await.unwrap();
	assert_eq!(conn.services(None).await.unwrap().len(), 1);

	let clients = conn.clients().await.unwrap();
	assert_eq!(clients.len(), 1);
	assert_eq!(clients[0].client_address, addr);
}

#[tokio::test]
async fn track_round_trip_is_reported_as_latency() {
	let mut domain = tcp_domain();
	domain.idle = IdleLimit { min: 1, max: 2 };
	let (_server, addr) = start(vec![domain], ResourcesConf::default()).await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let mut track = conn.track().await.unwrap();

	let query = tokio::time::timeout(Duration::from_millis(2500), track.next_notify())
		.await
		.expect("expected a track query")
		.unwrap();
	assert_eq!(query, sd_client::TrackType::Query);
	track.reply();

	// allow the reply to land before asking
	tokio::time::sleep(Duration::from_millis(100)).await;
	let mut observer = Client::connect(&addr).await.unwrap();
	let clients = observer.clients().await.unwrap();
	let row = clients.iter().find(|c| c.client_id == conn.client_id()).unwrap();
	let latency = row.latency.expect("latency after a track round trip");
	assert!(latency >= 0.0);
	assert!(latency < 2.0);
}

#[tokio::test]
async fn integer_property_values_survive_the_wire() {
	let (_server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	let service_props = props(&[("name", &["db".into()]), ("port", &[5432.into()]), ("weight", &[(-1).into()])]);
	conn.publish(1, 1, &service_props, 10).await.unwrap();

	let services = conn.services(Some("(port>5000)")).await.unwrap();
	assert_eq!(services.len(), 1);
	assert_eq!(services[0].props, service_props);

	assert!(conn.services(Some("(port>6000)")).await.unwrap().is_empty());
	assert_eq!(conn.services(Some("(port=5432)")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn graceful_shutdown_closes_connections() {
	let (server, addr) = start_default().await;

	let mut conn = Client::connect(&addr).await.unwrap();
	conn.publish(1, 1, &name_props("x"), 10).await.unwrap();

	server.shutdown();
	server.join().await;

	assert!(conn.ping().await.is_err());
	assert!(Client::connect(&addr).await.is_err());
}
