use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::story::{AuthorReel, StoryItem};

pub const STORY_MEDIA_PATH: &str = "static/story_pics";
pub const POST_MEDIA_PATH: &str = "static/uploads";

// Filenames land in a URL path segment; escape everything a browser would.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("feed client user agent required");
        }
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|err| anyhow!("feed client base url {:?}: {err}", config.base_url))?;

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    /// The signed-in feed: posts plus the per-author story reels shown as
    /// the tray above it.
    pub fn feed(&self) -> Result<FeedPayload> {
        let url = self.endpoint("api/feed")?;
        let payload: FeedPayload = self.get_json(url)?;
        Ok(payload)
    }

    /// One author's serialized reel, newest last, server-filtered to the
    /// active 24-hour window.
    pub fn author_reel(&self, username: &str) -> Result<ReelPayload> {
        let url = self.endpoint(&format!(
            "api/stories/{}",
            utf8_percent_encode(username, PATH_SEGMENT)
        ))?;
        let payload: ReelPayload = self.get_json(url)?;
        Ok(payload)
    }

    /// Toggle the like on a post. The server answers with the new state;
    /// callers apply it only from this response, never optimistically.
    pub fn toggle_like(&self, post_id: i64) -> Result<LikeOutcome> {
        let url = self.endpoint(&format!("like_post/{post_id}"))?;
        let response = self
            .http
            .post(url)
            .header(USER_AGENT, &self.user_agent)
            .send()?;
        if !response.status().is_success() {
            bail!("like request failed with status {}", response.status());
        }
        Ok(response.json()?)
    }

    /// Delete a story item by id. Only offered to the reel's owner.
    pub fn delete_story(&self, story_id: i64) -> Result<()> {
        let url = self.endpoint(&format!("delete_story/{story_id}"))?;
        let response = self
            .http
            .post(url)
            .header(USER_AGENT, &self.user_agent)
            .send()?;
        if !response.status().is_success() {
            bail!("delete request failed with status {}", response.status());
        }
        Ok(())
    }

    /// Absolute URL of a story's media file.
    pub fn story_media_url(&self, filename: &str) -> Result<Url> {
        self.endpoint(&format!(
            "{STORY_MEDIA_PATH}/{}",
            utf8_percent_encode(filename, PATH_SEGMENT)
        ))
    }

    /// Absolute URL of a feed post's media file.
    pub fn post_media_url(&self, filename: &str) -> Result<Url> {
        self.endpoint(&format!(
            "{POST_MEDIA_PATH}/{}",
            utf8_percent_encode(filename, PATH_SEGMENT)
        ))
    }

    /// Absolute URL for a server-relative path, such as the author picture
    /// path carried in a reel payload.
    pub fn absolute_url(&self, path: &str) -> Result<Url> {
        self.endpoint(path)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| anyhow!("feed endpoint {path:?}: {err}"))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()?;
        if !response.status().is_success() {
            bail!("feed request failed with status {}", response.status());
        }
        Ok(response.json()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeedPayload {
    #[serde(default)]
    pub posts: Vec<PostPayload>,
    #[serde(default)]
    pub reels: Vec<ReelPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostPayload {
    pub id: i64,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub filename: String,
    pub author: String,
    #[serde(default)]
    pub likes_count: i64,
    #[serde(default)]
    pub liked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReelPayload {
    pub author: String,
    #[serde(default)]
    pub author_pic: String,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub stories: Vec<StoryPayload>,
}

impl ReelPayload {
    pub fn into_reel(self) -> AuthorReel {
        // The server is supposed to drop expired stories, but a stale payload
        // can still carry some. Keep only items inside the 24-hour window.
        let now = Utc::now();
        AuthorReel {
            author: self.author,
            author_pic: self.author_pic,
            is_owner: self.is_owner,
            items: self
                .stories
                .into_iter()
                .map(|story| StoryItem {
                    id: story.id,
                    filename: story.filename,
                    posted_at: story.posted_at,
                })
                .filter(|item| item.is_active(now))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryPayload {
    pub id: i64,
    pub filename: String,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeStatus {
    Liked,
    Unliked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LikeOutcome {
    pub status: LikeStatus,
    pub likes_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(ClientConfig {
            base_url: "http://feed.test/".into(),
            user_agent: "story-tui/test".into(),
            http_client: None,
        })
        .unwrap()
    }

    #[test]
    fn rejects_blank_user_agent() {
        let err = Client::new(ClientConfig {
            base_url: "http://feed.test/".into(),
            user_agent: "  ".into(),
            http_client: None,
        });
        assert!(err.is_err());
    }

    #[test]
    fn builds_story_media_urls_with_escaped_filenames() {
        let url = client().story_media_url("my clip #1.mp4").unwrap();
        assert_eq!(
            url.as_str(),
            "http://feed.test/static/story_pics/my%20clip%20%231.mp4"
        );
    }

    #[test]
    fn parses_like_outcome() {
        let outcome: LikeOutcome =
            serde_json::from_str(r#"{"status": "liked", "likes_count": 12}"#).unwrap();
        assert_eq!(outcome.status, LikeStatus::Liked);
        assert_eq!(outcome.likes_count, 12);

        let outcome: LikeOutcome =
            serde_json::from_str(r#"{"status": "unliked", "likes_count": 11}"#).unwrap();
        assert_eq!(outcome.status, LikeStatus::Unliked);
    }

    #[test]
    fn parses_feed_payload() {
        let payload: FeedPayload = serde_json::from_str(
            r#"{
                "posts": [
                    {"id": 4, "caption": "hi", "filename": "p.jpg",
                     "author": "ivy", "likes_count": 3, "liked": true}
                ],
                "reels": [
                    {"author": "ivy", "author_pic": "/static/profile_pics/ivy.png",
                     "is_owner": false,
                     "stories": [
                        {"id": 1, "filename": "a.jpg"},
                        {"id": 2, "filename": "b.mp4"}
                     ]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(payload.posts.len(), 1);
        assert!(payload.posts[0].liked);
        let reel = payload.reels[0].clone().into_reel();
        assert_eq!(reel.author, "ivy");
        assert_eq!(reel.items.len(), 2);
        assert_eq!(reel.items[0].id, 1);
        assert_eq!(reel.items[1].filename, "b.mp4");
    }

    #[test]
    fn into_reel_drops_expired_stories() {
        let now = Utc::now();
        let payload: ReelPayload = serde_json::from_str(&format!(
            r#"{{"author": "ivy", "stories": [
                {{"id": 1, "filename": "old.jpg", "posted_at": "{}"}},
                {{"id": 2, "filename": "new.jpg", "posted_at": "{}"}}
            ]}}"#,
            (now - chrono::Duration::hours(25)).to_rfc3339(),
            (now - chrono::Duration::hours(1)).to_rfc3339(),
        ))
        .unwrap();
        let reel = payload.into_reel();
        assert_eq!(reel.items.len(), 1);
        assert_eq!(reel.items[0].id, 2);
    }

    #[test]
    fn absolute_url_joins_server_relative_paths() {
        let url = client().absolute_url("/static/profile_pics/ivy.png").unwrap();
        assert_eq!(url.as_str(), "http://feed.test/static/profile_pics/ivy.png");
    }

    #[test]
    fn reel_payload_defaults_to_viewer_ownership_off() {
        let payload: ReelPayload =
            serde_json::from_str(r#"{"author": "finn", "stories": []}"#).unwrap();
        let reel = payload.into_reel();
        assert!(!reel.is_owner);
        assert!(reel.items.is_empty());
    }
}
