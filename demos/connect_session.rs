use std::error::Error;
use std::time::Duration;

use relaychat_sdk::{ChatSession, ConnectOptions, SdkConfig, TokenPair};

fn main() -> Result<(), Box<dyn Error>> {
    let server_url = "https://chat.example.com".to_string();
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let refresh_token = "REPLACE_WITH_REFRESH_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = ChatSession::new(SdkConfig::new(server_url).with_debug(true))?;

        session.set_refresh_callback(|| async {
            // call your auth backend here and return the rotated pair
            Ok(TokenPair {
                access_token: "REPLACE_WITH_ROTATED_ACCESS_TOKEN".to_string(),
                refresh_token: None,
            })
        });

        let _connected = session.on_connected(|| println!("connected"));
        let _disconnected = session
            .on_disconnected(|reason| println!("disconnected: {}", reason.as_str()));
        let _reconnecting =
            session.on_reconnecting(|attempt| println!("reconnecting, attempt {attempt}"));

        session
            .connect(ConnectOptions::new(access_token).with_refresh_token(refresh_token))
            .await?;
        println!(
            "session ready, user id: {:?}",
            session.current_user_id()
        );

        let _receipts = session.messages.subscribe_to_read_receipts(|receipt| {
            println!("read receipt for {} in {}", receipt.message_id, receipt.channel_id);
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        session.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
