use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config;
use crate::data::{
    self, FeedService, HttpFeedService, HttpInteractionService, HttpStoryService,
    InteractionService, StoryService,
};
use crate::feed;
use crate::media;
use crate::ui;

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let config_path = config::default_path();
    let display_path = friendly_path(config_path.as_ref());

    let user_agent = if !cfg.server.user_agent.trim().is_empty() {
        cfg.server.user_agent.clone()
    } else {
        format!("story-tui/{}", crate::VERSION)
    };

    let mut feed_client: Option<Arc<feed::Client>> = None;
    let feed_service: Arc<dyn FeedService>;
    let story_service: Arc<dyn StoryService>;
    let interaction_service: Arc<dyn InteractionService>;
    let status: String;

    match feed::Client::new(feed::ClientConfig {
        base_url: cfg.server.base_url.clone(),
        user_agent: user_agent.clone(),
        http_client: None,
    }) {
        Ok(client) => {
            let client = Arc::new(client);
            feed_service = Arc::new(HttpFeedService::new(client.clone()));
            story_service = Arc::new(HttpStoryService::new(client.clone()));
            interaction_service = Arc::new(HttpInteractionService::new(client.clone()));
            feed_client = Some(client);
            status =
                "Loading your feed. Tab panes · j/k move · Enter open/like · r refresh · q quit"
                    .to_string();
        }
        Err(err) => {
            // Canned data keeps the interface explorable when the server
            // address is misconfigured.
            feed_service = Arc::new(data::MockFeedService);
            story_service = Arc::new(data::MockStoryService);
            interaction_service = Arc::new(data::MockInteractionService);
            status = format!("Offline mode: {err}");
        }
    }

    let media_cfg = media::Config {
        cache_dir: cfg.media.cache_dir.clone(),
        max_size_bytes: cfg.media.max_size_bytes,
        default_ttl: cfg.media.default_ttl,
        workers: cfg.media.workers,
        http_client: None,
    };
    let media_manager = media::Manager::new(media_cfg).ok();
    let media_handle = media_manager.as_ref().map(|manager| manager.handle());

    let options = ui::Options {
        status_message: status,
        theme: cfg.ui.theme.clone(),
        feed_service: Some(feed_service),
        story_service: Some(story_service),
        interaction_service: Some(interaction_service),
        feed_client,
        media_handle,
        mpv_path: cfg.player.mpv_path.clone(),
        user_agent,
        config_path: display_path,
    };

    let mut model = ui::Model::new(options);
    model.run()?;

    drop(media_manager);

    Ok(())
}

fn friendly_path(path: Option<&std::path::PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/story-tui/config.yaml".to_string()
    }
}
