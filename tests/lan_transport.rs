mod common;

use common::*;
use futures_util::future::join_all;
use miot::protocol::SubscribeBeacon;
use miot::{ClientConfig, DeviceInfo, LanDeviceInfo, MainLoop, MiotClient, MiotError, MiotLan, PropertyMessage, Route};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WILDCARD_BEACON: SubscribeBeacon = SubscribeBeacon {
    epoch: 1,
    sub_type: 0,
    wildcard: true,
};

#[tokio::test]
async fn lan_only_device_answers_through_the_client() {
    init_logger();
    let device = FakeDevice::start(100_001, TOKEN, None, standard_responder(json!(42))).await;
    let did = device.did_str();
    let main = MainLoop::current().unwrap();
    let lan = Arc::new(MiotLan::start(lan_config(device.port), main.clone()).unwrap());
    let client = MiotClient::builder(ClientConfig::default()).lan(lan).build(main);
    client
        .init(vec![DeviceInfo::new(&did, "lamp", "yeelink.light.lamp1").with_token(TOKEN)])
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || client.device_online(&did) == Some(true)).await);
    let started = Instant::now();
    assert_eq!(client.get_prop(&did, 2, 1).await.unwrap(), json!(42));
    assert!(started.elapsed() < Duration::from_secs(2));

    client.set_prop(&did, 2, 1, json!(false)).await.unwrap();
    assert_eq!(client.action(&did, 5, 1, vec![]).await.unwrap(), vec![json!(5), json!(1)]);
    assert_eq!(device.received_method("set_properties"), 1);
    client.deinit().await;
}

#[tokio::test]
async fn permuted_replies_reach_their_own_callers() {
    init_logger();
    // later siids answer first
    let responder: Responder = Arc::new(|msg: &Value| {
        let siid = msg["params"][0]["siid"].as_u64()?;
        let body = json!({"result": [{
            "did": msg["params"][0]["did"], "siid": siid, "piid": 1,
            "code": 0, "value": siid * 100,
        }]});
        Some((body, Duration::from_millis((10 - siid) * 30)))
    });
    let device = FakeDevice::start(100_002, TOKEN, None, responder).await;
    let did = device.did_str();
    let lan = MiotLan::start(lan_config(device.port), MainLoop::current().unwrap()).unwrap();
    lan.update_devices(vec![LanDeviceInfo::new(did.clone(), TOKEN)]).unwrap();
    wait_lan_online(&lan, &did).await;

    let calls = (1..=8u32).map(|siid| lan.get_prop(&did, siid, 1, None));
    let results = join_all(calls).await;
    for (siid, result) in (1..=8u64).zip(results) {
        assert_eq!(result.unwrap(), json!(siid * 100));
    }
    lan.shutdown().await;
}

#[tokio::test]
async fn rotated_token_replaces_the_cipher() {
    init_logger();
    let device = FakeDevice::start(100_003, TOKEN, None, standard_responder(json!("on"))).await;
    let did = device.did_str();
    let lan = MiotLan::start(lan_config(device.port), MainLoop::current().unwrap()).unwrap();
    lan.update_devices(vec![LanDeviceInfo::new(did.clone(), TOKEN)]).unwrap();
    wait_lan_online(&lan, &did).await;
    assert_eq!(lan.get_prop(&did, 2, 1, None).await.unwrap(), json!("on"));

    let pushed = Arc::new(Mutex::new(Vec::<PropertyMessage>::new()));
    let sink = pushed.clone();
    lan.sub_prop(&did, None, None, Arc::new(move |msg| sink.lock().push(msg)))
        .unwrap();

    // the device moved on, we still hold the old token
    device.rotate_token(NEW_TOKEN);
    let stale = lan.get_prop(&did, 2, 1, Some(Duration::from_millis(300))).await;
    assert_eq!(stale, Err(MiotError::Timeout));
    assert!(device.rejected() >= 1);

    // frames under the new token fail our integrity check and are dropped
    device
        .push("properties_changed", json!([{"did": did, "siid": 2, "piid": 1, "value": "off"}]))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pushed.lock().is_empty());

    lan.update_devices(vec![LanDeviceInfo::new(did.clone(), NEW_TOKEN)]).unwrap();
    assert_eq!(lan.get_prop(&did, 2, 1, None).await.unwrap(), json!("on"));
    // liveness survived the rotation
    assert!(lan.get_dev_list().await.unwrap().contains_key(&did));
    lan.shutdown().await;
}

#[tokio::test]
async fn subscribed_device_pushes_to_client_observers() {
    init_logger();
    let device = FakeDevice::start(100_004, TOKEN, Some(WILDCARD_BEACON), standard_responder(json!(1))).await;
    let did = device.did_str();
    let main = MainLoop::current().unwrap();
    let lan = MiotLan::start(lan_config(device.port).with_subscribe(true), main.clone()).unwrap();
    let client = MiotClient::builder(ClientConfig::default())
        .lan(Arc::new(lan))
        .build(main);
    client
        .init(vec![DeviceInfo::new(&did, "switch", "chuangmi.plug.v3").with_token(TOKEN)])
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || client.push_source(&did) == Some(Route::Lan)).await);
    assert_eq!(device.received_method("miIO.sub"), 1);

    let pushed = Arc::new(Mutex::new(Vec::<PropertyMessage>::new()));
    let sink = pushed.clone();
    client
        .sub_prop(&did, Some(2), Some(1), Arc::new(move |msg| sink.lock().push(msg)))
        .unwrap();

    let id = device
        .push("properties_changed", json!([{"did": did, "siid": 2, "piid": 1, "value": true}]))
        .await;
    // a retransmission inside the dedup window is acked but not delivered twice
    device
        .push_with_id(id, "properties_changed", json!([{"did": did, "siid": 2, "piid": 1, "value": true}]))
        .await;

    assert!(wait_until(Duration::from_secs(1), || !pushed.lock().is_empty()).await);
    let acks = || {
        device
            .received()
            .iter()
            .filter(|m| m["id"] == json!(id) && m["result"]["code"] == json!(0))
            .count()
    };
    assert!(wait_until(Duration::from_secs(1), || acks() == 2).await);
    let got = pushed.lock().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].value, json!(true));
    assert_eq!(got[0].did, did);
    client.deinit().await;
}

#[tokio::test]
async fn new_beacon_epoch_triggers_resubscribe() {
    init_logger();
    let device = FakeDevice::start(100_005, TOKEN, Some(WILDCARD_BEACON), standard_responder(json!(1))).await;
    let did = device.did_str();
    let lan = MiotLan::start(lan_config(device.port).with_subscribe(true), MainLoop::current().unwrap()).unwrap();
    lan.update_devices(vec![LanDeviceInfo::new(did.clone(), TOKEN)]).unwrap();

    assert!(wait_until(Duration::from_secs(3), || device.received_method("miIO.sub") == 1).await);
    wait_lan_subscribed(&lan, &did).await;
    device.reset_epoch(7);
    lan.ping(None, None).unwrap();
    assert!(wait_until(Duration::from_secs(3), || device.received_method("miIO.sub") == 2).await);
    wait_lan_subscribed(&lan, &did).await;

    lan.update_subscribe_option(false).unwrap();
    assert!(wait_until(Duration::from_secs(1), || device.received_method("miIO.unsub") == 1).await);
    lan.shutdown().await;
}

#[tokio::test]
async fn closing_every_interface_takes_devices_offline() {
    init_logger();
    let device = FakeDevice::start(100_006, TOKEN, None, standard_responder(json!(0))).await;
    let did = device.did_str();
    let main = MainLoop::current().unwrap();
    let lan = Arc::new(MiotLan::start(lan_config(device.port), main.clone()).unwrap());
    let client = MiotClient::builder(ClientConfig::default())
        .lan(lan.clone())
        .build(main);
    client
        .init(vec![DeviceInfo::new(&did, "fan", "zhimi.fan.v3").with_token(TOKEN)])
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(3), || client.device_online(&did) == Some(true)).await);

    lan.update_net_ifs(vec![]).unwrap();
    assert!(wait_until(Duration::from_secs(1), || client.device_online(&did) == Some(false)).await);
    let err = client.get_prop(&did, 2, 1).await.unwrap_err();
    assert!(err.is_unreachable());
    client.deinit().await;
}

#[tokio::test]
async fn unheard_device_is_unreachable_at_once() {
    init_logger();
    let lan = MiotLan::start(lan_config(9), MainLoop::current().unwrap()).unwrap();
    lan.update_devices(vec![LanDeviceInfo::new("100007", TOKEN)]).unwrap();
    let err = lan.get_prop("100007", 2, 1, None).await.unwrap_err();
    assert!(matches!(err, MiotError::TransportUnreachable(_)));
    lan.shutdown().await;
}

#[tokio::test]
async fn flapping_device_is_held_offline_until_resume() {
    init_logger();
    let device = FakeDevice::start(100_008, TOKEN, None, standard_responder(json!(0))).await;
    let did = device.did_str();
    let resume = Duration::from_millis(600);
    let config = lan_config(device.port)
        .with_scan_interval(Duration::from_millis(30), Duration::from_millis(60))
        .with_keep_alive(Duration::from_millis(20), Duration::from_millis(40), Duration::from_millis(20))
        .with_flap_damping(10, Duration::from_secs(60), resume);
    let lan = MiotLan::start(config, MainLoop::current().unwrap()).unwrap();
    let flips = Arc::new(Mutex::new(Vec::<bool>::new()));
    let sink = flips.clone();
    lan.sub_device_state("test", Arc::new(move |_, state| sink.lock().push(state.online)))
        .unwrap();
    lan.update_devices(vec![LanDeviceInfo::new(did.clone(), TOKEN)]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || flips.lock().len() == 1).await);

    // flips two to ten go through
    for n in 2..=10 {
        device.set_muted(n % 2 == 0);
        assert!(
            wait_until(Duration::from_secs(2), || flips.lock().len() == n).await,
            "flip {} not seen",
            n
        );
    }
    assert_eq!(flips.lock().last(), Some(&false));

    // the eleventh, back online, lands inside the window and is held back
    let answered = device.probes();
    device.set_muted(false);
    let unmuted = Instant::now();
    assert!(wait_until(Duration::from_secs(1), || device.probes() > answered).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(flips.lock().len(), 10);
    assert!(!lan.get_dev_list().await.unwrap().contains_key(&did));

    assert!(wait_until(Duration::from_secs(2), || flips.lock().len() == 11).await);
    assert!(unmuted.elapsed() >= resume - Duration::from_millis(100));
    assert_eq!(flips.lock().last(), Some(&true));
    lan.shutdown().await;
}
