use anyhow::{Context, Result};
use std::sync::Arc;

use crate::feed::{self, FeedPayload, LikeOutcome, LikeStatus};
use crate::story::AuthorReel;

pub trait FeedService: Send + Sync {
    fn load_feed(&self) -> Result<FeedPayload>;
}

pub trait StoryService: Send + Sync {
    fn author_reel(&self, username: &str) -> Result<AuthorReel>;
    fn delete_story(&self, story_id: i64) -> Result<()>;
}

pub trait InteractionService: Send + Sync {
    fn toggle_like(&self, post_id: i64) -> Result<LikeOutcome>;
}

pub struct HttpFeedService {
    client: Arc<feed::Client>,
}

impl HttpFeedService {
    pub fn new(client: Arc<feed::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for HttpFeedService {
    fn load_feed(&self) -> Result<FeedPayload> {
        self.client.feed().context("fetch feed")
    }
}

pub struct HttpStoryService {
    client: Arc<feed::Client>,
}

impl HttpStoryService {
    pub fn new(client: Arc<feed::Client>) -> Self {
        Self { client }
    }
}

impl StoryService for HttpStoryService {
    fn author_reel(&self, username: &str) -> Result<AuthorReel> {
        let payload = self
            .client
            .author_reel(username)
            .with_context(|| format!("fetch stories for {username}"))?;
        Ok(payload.into_reel())
    }

    fn delete_story(&self, story_id: i64) -> Result<()> {
        self.client
            .delete_story(story_id)
            .with_context(|| format!("delete story {story_id}"))
    }
}

pub struct HttpInteractionService {
    client: Arc<feed::Client>,
}

impl HttpInteractionService {
    pub fn new(client: Arc<feed::Client>) -> Self {
        Self { client }
    }
}

impl InteractionService for HttpInteractionService {
    fn toggle_like(&self, post_id: i64) -> Result<LikeOutcome> {
        self.client
            .toggle_like(post_id)
            .with_context(|| format!("toggle like on post {post_id}"))
    }
}

#[derive(Default)]
pub struct MockFeedService;

impl FeedService for MockFeedService {
    fn load_feed(&self) -> Result<FeedPayload> {
        Ok(serde_json::from_str(
            r#"{
                "posts": [
                    {"id": 1, "caption": "Sample post for offline browsing.",
                     "filename": "sample.jpg", "author": "story-tui",
                     "likes_count": 3, "liked": false}
                ],
                "reels": [
                    {"author": "story-tui", "author_pic": "", "is_owner": false,
                     "stories": [
                        {"id": 1, "filename": "first.jpg"},
                        {"id": 2, "filename": "second.jpg"}
                     ]}
                ]
            }"#,
        )?)
    }
}

#[derive(Default)]
pub struct MockStoryService;

impl StoryService for MockStoryService {
    fn author_reel(&self, username: &str) -> Result<AuthorReel> {
        let payload: feed::ReelPayload = serde_json::from_str(&format!(
            r#"{{"author": "{username}", "author_pic": "", "is_owner": false,
                "stories": [
                    {{"id": 1, "filename": "first.jpg"}},
                    {{"id": 2, "filename": "second.jpg"}}
                ]}}"#
        ))?;
        Ok(payload.into_reel())
    }

    fn delete_story(&self, _story_id: i64) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MockInteractionService;

impl InteractionService for MockInteractionService {
    fn toggle_like(&self, _post_id: i64) -> Result<LikeOutcome> {
        Ok(LikeOutcome {
            status: LikeStatus::Liked,
            likes_count: 1,
        })
    }
}
