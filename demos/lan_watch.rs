/**
 * LAN Watch Example
 *
 * Starts the LAN transport on one interface, hands a single device to the
 * orchestrator and prints every state change and property push it reports.
 *
 * Usage: lan_watch <interface> <did> <token>
 */
use futures_util::StreamExt;
use miot::{ClientConfig, ClientEvent, DeviceInfo, LanConfig, MainLoop, MiotClient, MiotLan};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> miot::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let (if_name, did, token) = match args.as_slice() {
        [_, if_name, did, token] => (if_name.clone(), did.clone(), token.clone()),
        _ => {
            eprintln!("usage: lan_watch <interface> <did> <token>");
            return Ok(());
        }
    };

    println!("--- miot {} - LAN Watch ---", miot::version());

    // 1. LAN transport with push subscriptions enabled
    let main = MainLoop::current()?;
    let lan = MiotLan::start(LanConfig::new([if_name]).with_subscribe(true), main.clone())?;

    // 2. Orchestrator over LAN only
    let client = MiotClient::builder(ClientConfig::default())
        .lan(Arc::new(lan))
        .build(main);
    let stream = client.events();
    tokio::pin!(stream);
    client.init(vec![DeviceInfo::new(&did, "device", "").with_token(&token)]).await?;

    // 3. Print what the client reports
    let timeout = tokio::time::sleep(Duration::from_secs(120));
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            Some(event) = stream.next() => match event {
                ClientEvent::DeviceState { did, state } => {
                    println!("[STATE] {} -> {:?}", did, state);
                    if state == miot::DeviceState::Online {
                        match client.get_prop(&did, 2, 1).await {
                            Ok(value) => println!("[PROP] {}.2.1 = {}", did, value),
                            Err(e) => eprintln!("[ERROR] get_prop failed: {} ({})", e, e.code()),
                        }
                    }
                }
                ClientEvent::Property(msg) => {
                    println!("[PUSH] {}.{}.{} = {}", msg.did, msg.siid, msg.piid, msg.value)
                }
                ClientEvent::Event(msg) => {
                    println!("[EVENT] {}.{}.{} {:?}", msg.did, msg.siid, msg.eiid, msg.arguments)
                }
                other => println!("[INFO] {:?}", other),
            },
            _ = &mut timeout => {
                println!("[INFO] Example timeout reached. Exiting.");
                break;
            }
        }
    }

    client.deinit().await;
    Ok(())
}
