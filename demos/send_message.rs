use std::error::Error;

use relaychat_sdk::types::{ChannelType, CreateChannelParams, SendMessageParams};
use relaychat_sdk::{ChatSession, ConnectOptions, SdkConfig};

fn main() -> Result<(), Box<dyn Error>> {
    let server_url = "https://chat.example.com".to_string();
    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let peer_user_id = "REPLACE_WITH_PEER_USER_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = ChatSession::new(SdkConfig::new(server_url))?;
        session.connect(ConnectOptions::new(access_token)).await?;

        let channel = session
            .channels
            .create(&CreateChannelParams {
                channel_type: ChannelType::Direct,
                name: None,
                target_user_ids: vec![peer_user_id],
                match_id: None,
                metadata: None,
            })
            .await?;
        println!("channel ready: {}", channel.id);

        let message = session
            .messages
            .send(&channel.id, &SendMessageParams::text("hello from rust"))
            .await?;
        println!("sent message {} at {}", message.id, message.created_at);

        session.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
