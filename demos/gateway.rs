use dextra_gw::{Config, GatewayEvent, ReflectorServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Optional JSON config path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Config>(&text).map_err(|e| e.to_string()))
        {
            Ok(config) => config,
            Err(e) => {
                error!(%path, error = %e, "Unable to load configuration");
                return;
            }
        },
        None => Config::default(),
    };

    println!("Starting DExtra gateway:");
    println!("- Reflector socket: {}", config.bind_addr);
    println!("- Modem link: {:?}", config.link_endpoint());
    println!("- Reflector name: {}", config.reflector_name);

    let (server, mut events) = match ReflectorServer::bind(config).await {
        Ok(bound) => bound,
        Err(e) => {
            error!(error = %e, "Unable to start the gateway");
            return;
        }
    };

    let handle = server.handle();
    let mut server_task = tokio::spawn(server.run());

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                handle.shutdown();
            }
            finished = &mut server_task => break finished,
            Some(event) = events.recv() => log_event(event),
        }
    };

    match outcome {
        Ok(Ok(())) => info!("Gateway stopped"),
        Ok(Err(e)) => error!(error = %e, "Gateway failed"),
        Err(e) => error!(error = %e, "Gateway task panicked"),
    }
}

fn log_event(event: GatewayEvent) {
    match event {
        GatewayEvent::PeerBound { key, callsign, module } => {
            info!(peer = %key, %callsign, module = %(module as char), "Repeater linked");
        }
        GatewayEvent::PeerUnbound { key } => info!(peer = %key, "Repeater unlinked"),
        GatewayEvent::PeerExpired { key } => info!(peer = %key, "Repeater lost"),
        GatewayEvent::CallCompleted { key, payload } => {
            info!(
                peer = %key,
                stream_id = payload.stream_id,
                bytes = payload.data.len(),
                message = %payload.message_text(),
                "Call received"
            );
        }
        GatewayEvent::LinkData { key, data } => {
            info!(peer = %key, bytes = data.len(), "Modem data");
        }
    }
}
