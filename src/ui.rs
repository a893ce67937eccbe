use std::io::{self, Stdout, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::cursor::MoveTo;
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseButton,
    MouseEvent, MouseEventKind,
};
use crossterm::style::Print;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, window_size, EnterAlternateScreen, LeaveAlternateScreen,
    WindowSize,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::data::{FeedService, InteractionService, StoryService};
use crate::feed::{self, LikeOutcome, LikeStatus, PostPayload, ReelPayload};
use crate::media;
use crate::story::{self, AuthorReel, MediaKind, Segment, Transition, Viewer};
use crate::video;

const TOAST_TTL: Duration = Duration::from_secs(5);
const TICK_RATE: Duration = Duration::from_millis(120);
const KITTY_CHUNK_SIZE: usize = 4096;
const FALLBACK_CELL_PIXELS: (u16, u16) = (8, 16);

/// Color palette resolved from the `ui.theme` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    bg: Color,
    panel_bg: Color,
    border_idle: Color,
    border_focused: Color,
    text_primary: Color,
    text_secondary: Color,
    accent: Color,
    success: Color,
    error: Color,
    segment_empty: Color,
}

impl Palette {
    /// Unknown theme names fall back to the dark default.
    pub fn named(theme: &str) -> Self {
        match theme.trim().to_ascii_lowercase().as_str() {
            "latte" | "light" => Self::latte(),
            _ => Self::mocha(),
        }
    }

    fn mocha() -> Self {
        Self {
            bg: Color::Rgb(30, 30, 46),
            panel_bg: Color::Rgb(24, 24, 36),
            border_idle: Color::Rgb(49, 50, 68),
            border_focused: Color::Rgb(137, 180, 250),
            text_primary: Color::Rgb(205, 214, 244),
            text_secondary: Color::Rgb(166, 173, 200),
            accent: Color::Rgb(137, 180, 250),
            success: Color::Rgb(166, 227, 161),
            error: Color::Rgb(243, 139, 168),
            segment_empty: Color::Rgb(69, 71, 90),
        }
    }

    fn latte() -> Self {
        Self {
            bg: Color::Rgb(239, 241, 245),
            panel_bg: Color::Rgb(230, 233, 239),
            border_idle: Color::Rgb(188, 192, 204),
            border_focused: Color::Rgb(30, 102, 245),
            text_primary: Color::Rgb(76, 79, 105),
            text_secondary: Color::Rgb(108, 111, 133),
            accent: Color::Rgb(30, 102, 245),
            success: Color::Rgb(64, 160, 43),
            error: Color::Rgb(210, 15, 57),
            segment_empty: Color::Rgb(204, 208, 218),
        }
    }
}

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Reels,
    Posts,
}

impl Pane {
    fn title(&self) -> &'static str {
        match self {
            Pane::Reels => "Stories",
            Pane::Posts => "Feed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAction {
    Retreat,
    Advance,
}

/// Map a click inside the media region to a navigation action: the left
/// half retreats, the right half advances.
pub fn nav_action(column: u16, row: u16, media_area: Rect) -> Option<NavAction> {
    if column < media_area.x
        || column >= media_area.x + media_area.width
        || row < media_area.y
        || row >= media_area.y + media_area.height
    {
        return None;
    }
    if column < media_area.x + media_area.width / 2 {
        Some(NavAction::Retreat)
    } else {
        Some(NavAction::Advance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToastLevel {
    Info,
    Success,
    Error,
}

struct Toast {
    text: String,
    level: ToastLevel,
    shown_at: Instant,
}

impl Toast {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.shown_at) >= TOAST_TTL
    }
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= TICK_RATE {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

enum AsyncResponse {
    Feed {
        result: Result<feed::FeedPayload>,
    },
    Reel {
        result: Result<AuthorReel>,
    },
    Like {
        post_id: i64,
        result: Result<LikeOutcome>,
    },
    Delete {
        story_id: i64,
        result: Result<()>,
    },
}

struct KittyImage {
    id: u32,
    payload: String,
    cols: u16,
    rows: u16,
    transmitted: bool,
}

impl KittyImage {
    // Placement comes from the cursor position, set before this sequence
    // is written. Chunks follow the kitty graphics protocol, PNG payload.
    fn transmit_sequence(&self) -> String {
        let mut out = String::new();
        let bytes = self.payload.as_bytes();
        let mut offset = 0;
        let mut first = true;
        while offset < bytes.len() {
            let end = (offset + KITTY_CHUNK_SIZE).min(bytes.len());
            let chunk = &self.payload[offset..end];
            let more = if end < bytes.len() { 1 } else { 0 };
            if first {
                out.push_str(&format!(
                    "\x1b_Gf=100,a=T,i={},q=2,c={},r={},m={};{}\x1b\\",
                    self.id, self.cols, self.rows, more, chunk
                ));
                first = false;
            } else {
                out.push_str(&format!("\x1b_Gm={};{}\x1b\\", more, chunk));
            }
            offset = end;
        }
        out
    }

    fn delete_sequence(id: u32) -> String {
        format!("\x1b_Ga=d,d=i,i={id},q=2\x1b\\")
    }
}

/// Scale an image into the media region, preserving aspect ratio, in
/// terminal cells.
pub fn fit_cells(
    image_px: (u32, u32),
    area_cells: (u16, u16),
    cell_px: (u16, u16),
) -> (u16, u16) {
    let (img_w, img_h) = (image_px.0.max(1) as f64, image_px.1.max(1) as f64);
    let max_cols = area_cells.0.max(1) as f64;
    let max_rows = area_cells.1.max(1) as f64;
    let cell_w = cell_px.0.max(1) as f64;
    let cell_h = cell_px.1.max(1) as f64;

    let native_cols = img_w / cell_w;
    let native_rows = img_h / cell_h;
    let scale = (max_cols / native_cols).min(max_rows / native_rows).min(1.0);
    let cols = (native_cols * scale).round().max(1.0) as u16;
    let rows = (native_rows * scale).round().max(1.0) as u16;
    (cols.min(area_cells.0.max(1)), rows.min(area_cells.1.max(1)))
}

fn cell_pixel_size(ws: &WindowSize) -> (u16, u16) {
    if ws.columns > 0 && ws.rows > 0 && ws.width > 0 && ws.height > 0 {
        (ws.width / ws.columns, ws.height / ws.rows)
    } else {
        FALLBACK_CELL_PIXELS
    }
}

/// Truncate to a display width, unicode-aware.
pub fn truncate_to_width(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}

pub fn position_label(index: usize, len: usize) -> String {
    format!("{}/{}", index + 1, len)
}

/// Cells of a progress segment that should read as filled.
pub fn segment_fill_cells(width: u16, segment: Segment) -> u16 {
    match segment {
        Segment::Filled => width,
        Segment::Empty => 0,
        Segment::Animating { fraction } => {
            ((width as f64) * fraction).round().clamp(0.0, width as f64) as u16
        }
    }
}

#[derive(Clone)]
pub struct Options {
    pub status_message: String,
    pub theme: String,
    pub feed_service: Option<Arc<dyn FeedService>>,
    pub story_service: Option<Arc<dyn StoryService>>,
    pub interaction_service: Option<Arc<dyn InteractionService>>,
    pub feed_client: Option<Arc<feed::Client>>,
    pub media_handle: Option<media::Handle>,
    pub mpv_path: String,
    pub user_agent: String,
    pub config_path: String,
}

pub struct Model {
    status_message: String,
    palette: Palette,
    toast: Option<Toast>,
    reels: Vec<ReelPayload>,
    posts: Vec<PostPayload>,
    selected_reel: usize,
    selected_post: usize,
    focused_pane: Pane,

    viewer: Viewer,
    video_session: Option<(u64, video::InlineSession)>,
    pending_video: Option<u64>,
    pending_image: Option<u64>,
    current_image: Option<KittyImage>,
    pending_kitty_deletes: Vec<String>,
    media_area: Option<Rect>,
    next_kitty_id: u32,

    feed_service: Option<Arc<dyn FeedService>>,
    story_service: Option<Arc<dyn StoryService>>,
    interaction_service: Option<Arc<dyn InteractionService>>,
    feed_client: Option<Arc<feed::Client>>,
    media_handle: Option<media::Handle>,
    mpv_path: String,
    user_agent: String,
    config_path: String,

    spinner: Spinner,
    loading_feed: bool,
    opening_reel: bool,
    needs_redraw: bool,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    media_tx: Sender<media::ResultEntry>,
    media_rx: Receiver<media::ResultEntry>,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        let (media_tx, media_rx) = unbounded();
        let mut model = Self {
            status_message: opts.status_message,
            palette: Palette::named(&opts.theme),
            toast: None,
            reels: Vec::new(),
            posts: Vec::new(),
            selected_reel: 0,
            selected_post: 0,
            focused_pane: Pane::Reels,
            viewer: Viewer::new(),
            video_session: None,
            pending_video: None,
            pending_image: None,
            current_image: None,
            pending_kitty_deletes: Vec::new(),
            media_area: None,
            next_kitty_id: 1,
            feed_service: opts.feed_service,
            story_service: opts.story_service,
            interaction_service: opts.interaction_service,
            feed_client: opts.feed_client,
            media_handle: opts.media_handle,
            mpv_path: opts.mpv_path,
            user_agent: opts.user_agent,
            config_path: opts.config_path,
            spinner: Spinner::new(),
            loading_feed: false,
            opening_reel: false,
            needs_redraw: true,
            response_tx,
            response_rx,
            media_tx,
            media_rx,
        };
        model.reload_feed();
        model
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn toast(&mut self, level: ToastLevel, text: impl Into<String>) {
        self.toast = Some(Toast {
            text: text.into(),
            level,
            shown_at: Instant::now(),
        });
        self.mark_dirty();
    }

    fn is_loading(&self) -> bool {
        self.loading_feed || self.opening_reel
    }

    fn reload_feed(&mut self) {
        let Some(service) = self.feed_service.clone() else {
            self.toast(ToastLevel::Error, "Feed service unavailable.");
            return;
        };
        if self.loading_feed {
            return;
        }
        self.loading_feed = true;
        self.mark_dirty();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.load_feed();
            let _ = tx.send(AsyncResponse::Feed { result });
        });
    }

    fn open_selected_reel(&mut self) {
        let Some(payload) = self.reels.get(self.selected_reel).cloned() else {
            return;
        };
        if self.opening_reel {
            return;
        }
        match self.story_service.clone() {
            Some(service) => {
                self.opening_reel = true;
                self.mark_dirty();
                let tx = self.response_tx.clone();
                thread::spawn(move || {
                    let result = service.author_reel(&payload.author);
                    let _ = tx.send(AsyncResponse::Reel { result });
                });
            }
            None => self.open_reel(payload.into_reel()),
        }
    }

    fn open_reel(&mut self, reel: AuthorReel) {
        let author = reel.author.clone();
        let now = Instant::now();
        match self.viewer.open(reel, now) {
            Ok(step) => self.apply_transition(step),
            Err(story::StoryError::EmptyReel) => {
                self.teardown_playback();
                self.toast(
                    ToastLevel::Info,
                    format!("{author} has no active stories."),
                );
            }
            Err(err) => {
                self.teardown_playback();
                self.toast(ToastLevel::Error, format!("Could not open stories: {err}"));
            }
        }
        self.mark_dirty();
    }

    /// React to a state-machine step: stop whatever was playing, and start
    /// media for the newly shown item (or nothing, on close).
    fn apply_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::Closed => {
                self.teardown_playback();
                self.media_area = None;
                self.mark_dirty();
            }
            Transition::Show(_) => {
                self.teardown_playback();
                self.start_current_media();
                self.mark_dirty();
            }
        }
    }

    /// Cancel the superseded item's playback outputs: the running video (if
    /// any), the transmitted image, and any in-flight fetch.
    fn teardown_playback(&mut self) {
        if let Some((_, session)) = self.video_session.take() {
            let _ = session.stop_blocking();
        }
        self.pending_video = None;
        self.pending_image = None;
        if let Some(image) = self.current_image.take() {
            if image.transmitted {
                self.pending_kitty_deletes
                    .push(KittyImage::delete_sequence(image.id));
            }
        }
    }

    fn start_current_media(&mut self) {
        let Some(item) = self.viewer.current().cloned() else {
            return;
        };
        match item.kind() {
            MediaKind::Video => {
                // Deferred until a media region exists; the draw pass
                // records its geometry first.
                self.pending_video = Some(self.viewer.generation());
            }
            MediaKind::Image => self.request_image(&item.filename),
        }
    }

    fn request_image(&mut self, filename: &str) {
        let (Some(client), Some(handle)) = (self.feed_client.as_ref(), self.media_handle.clone())
        else {
            return;
        };
        let url = match client.story_media_url(filename) {
            Ok(url) => url.to_string(),
            Err(err) => {
                self.toast(ToastLevel::Error, format!("Bad media URL: {err}"));
                return;
            }
        };
        let generation = self.viewer.generation();
        self.pending_image = Some(generation);
        // The worker replies straight onto the model's channel; the tag
        // comes back with the result for the staleness check.
        handle.enqueue(
            media::Request {
                url,
                ttl: None,
                force: false,
                tag: generation,
            },
            self.media_tx.clone(),
        );
    }

    fn story_video_source(&self) -> Option<video::VideoSource> {
        let item = self.viewer.current()?;
        let client = self.feed_client.as_ref()?;
        let url = client.story_media_url(&item.filename).ok()?;
        Some(video::VideoSource {
            playback_url: url.to_string(),
            label: self
                .viewer
                .author()
                .map(|author| format!("{author}'s story"))
                .unwrap_or_else(|| "story".to_string()),
        })
    }

    /// Launch mpv for a pending video item once the media region geometry
    /// is known. Called after every draw.
    fn ensure_video_session(&mut self) {
        let Some(generation) = self.pending_video else {
            return;
        };
        if generation != self.viewer.generation() || self.video_session.is_some() {
            self.pending_video = None;
            return;
        }
        let Some(area) = self.media_area else {
            return;
        };
        let Some(source) = self.story_video_source() else {
            self.pending_video = None;
            self.toast(ToastLevel::Error, "Video URL unavailable.");
            return;
        };

        let ws = window_size().unwrap_or(WindowSize {
            rows: 0,
            columns: 0,
            width: 0,
            height: 0,
        });
        let (cell_w, cell_h) = cell_pixel_size(&ws);
        let opts = video::InlineLaunchOptions {
            mpv_path: &self.mpv_path,
            source: &source,
            user_agent: &self.user_agent,
            col: area.x,
            row: area.y,
            term_cols: i32::from(area.width),
            term_rows: i32::from(area.height),
            pixel_width: i32::from(area.width) * i32::from(cell_w),
            pixel_height: i32::from(area.height) * i32::from(cell_h),
        };
        match video::spawn_inline_player(opts) {
            Ok(session) => {
                self.video_session = Some((generation, session));
                self.pending_video = None;
            }
            Err(err) => {
                self.pending_video = None;
                self.toast(ToastLevel::Error, format!("Video playback failed: {err}"));
            }
        }
    }

    /// Poll the running video session for its natural end, which is what
    /// advances a video item.
    fn poll_video(&mut self) {
        let Some((generation, session)) = self.video_session.as_mut() else {
            return;
        };
        let generation = *generation;
        match session.try_status() {
            None => {}
            Some(Ok(status)) => {
                self.video_session = None;
                if status.success() {
                    let step = self.viewer.video_ended(generation, Instant::now());
                    self.apply_transition(step);
                } else {
                    video::debug_log(format!("mpv exited with {:?}", status.code()));
                    self.toast(ToastLevel::Error, "Video player exited unexpectedly.");
                }
            }
            Some(Err(err)) => {
                self.video_session = None;
                self.toast(ToastLevel::Error, format!("Video playback failed: {err}"));
            }
        }
    }

    fn toggle_like_selected(&mut self) {
        let Some(post) = self.posts.get(self.selected_post) else {
            return;
        };
        let Some(service) = self.interaction_service.clone() else {
            self.toast(ToastLevel::Error, "Sign in to like posts.");
            return;
        };
        let post_id = post.id;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.toggle_like(post_id);
            let _ = tx.send(AsyncResponse::Like { post_id, result });
        });
    }

    fn delete_current_story(&mut self) {
        let Some(story_id) = self.viewer.delete_target() else {
            self.toast(ToastLevel::Info, "Only your own stories can be deleted.");
            return;
        };
        let Some(service) = self.story_service.clone() else {
            self.toast(ToastLevel::Error, "Story service unavailable.");
            return;
        };
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.delete_story(story_id);
            let _ = tx.send(AsyncResponse::Delete { story_id, result });
        });
    }

    fn open_author_pic_in_browser(&mut self) {
        let Some(path) = self.viewer.author_pic().map(str::to_string) else {
            return;
        };
        if path.is_empty() {
            self.toast(ToastLevel::Info, "No profile picture for this author.");
            return;
        }
        let Some(client) = self.feed_client.as_ref() else {
            return;
        };
        match client.absolute_url(&path) {
            Ok(url) => {
                if webbrowser::open(url.as_str()).is_err() {
                    self.toast(ToastLevel::Error, "Could not open a browser.");
                }
            }
            Err(err) => self.toast(ToastLevel::Error, format!("Bad profile URL: {err}")),
        }
    }

    fn open_selected_post_media(&mut self) {
        let Some(post) = self.posts.get(self.selected_post) else {
            return;
        };
        if post.filename.is_empty() {
            self.toast(ToastLevel::Info, "This post has no media.");
            return;
        }
        let filename = post.filename.clone();
        let Some(client) = self.feed_client.as_ref() else {
            return;
        };
        match client.post_media_url(&filename) {
            Ok(url) => {
                if webbrowser::open(url.as_str()).is_err() {
                    self.toast(ToastLevel::Error, "Could not open a browser.");
                }
            }
            Err(err) => self.toast(ToastLevel::Error, format!("Bad media URL: {err}")),
        }
    }

    fn open_current_in_browser(&mut self) {
        let Some(item) = self.viewer.current() else {
            return;
        };
        let Some(client) = self.feed_client.as_ref() else {
            return;
        };
        match client.story_media_url(&item.filename) {
            Ok(url) => {
                if webbrowser::open(url.as_str()).is_err() {
                    self.toast(ToastLevel::Error, "Could not open a browser.");
                }
            }
            Err(err) => self.toast(ToastLevel::Error, format!("Bad media URL: {err}")),
        }
    }

    fn poll_async(&mut self) -> bool {
        let mut handled = false;
        while let Ok(response) = self.response_rx.try_recv() {
            handled = true;
            match response {
                AsyncResponse::Feed { result } => {
                    self.loading_feed = false;
                    match result {
                        Ok(payload) => {
                            self.reels = payload.reels;
                            self.posts = payload.posts;
                            self.selected_reel = self
                                .selected_reel
                                .min(self.reels.len().saturating_sub(1));
                            self.selected_post = self
                                .selected_post
                                .min(self.posts.len().saturating_sub(1));
                            self.status_message = format!(
                                "{} reels, {} posts. Tab panes · j/k move · Enter open/like · o media · r refresh · q quit",
                                self.reels.len(),
                                self.posts.len()
                            );
                        }
                        Err(err) => {
                            self.toast(ToastLevel::Error, format!("Feed refresh failed: {err}"))
                        }
                    }
                }
                AsyncResponse::Reel { result } => {
                    self.opening_reel = false;
                    match result {
                        Ok(reel) => self.open_reel(reel),
                        Err(err) => {
                            self.toast(ToastLevel::Error, format!("Could not load stories: {err}"))
                        }
                    }
                }
                AsyncResponse::Like { post_id, result } => match result {
                    Ok(outcome) => {
                        if let Some(post) = self.posts.iter_mut().find(|post| post.id == post_id) {
                            post.likes_count = outcome.likes_count;
                            post.liked = outcome.status == LikeStatus::Liked;
                        }
                    }
                    // Transport failure: report it and leave the shown
                    // count untouched; nothing was applied optimistically.
                    Err(err) => self.toast(ToastLevel::Error, format!("Like failed: {err}")),
                },
                AsyncResponse::Delete { story_id, result } => match result {
                    Ok(()) => {
                        let _ = story_id;
                        let step = self.viewer.close();
                        self.apply_transition(step);
                        self.toast(ToastLevel::Success, "Story deleted.");
                        self.reload_feed();
                    }
                    Err(err) => self.toast(ToastLevel::Error, format!("Delete failed: {err}")),
                },
            }
        }
        while let Ok(reply) = self.media_rx.try_recv() {
            handled = true;
            self.apply_media_response(reply);
        }
        handled
    }

    fn apply_media_response(&mut self, result: media::ResultEntry) {
        if self.pending_image != Some(result.tag) || result.tag != self.viewer.generation() {
            // Stale fetch for an item no longer shown.
            return;
        }
        self.pending_image = None;
        if let Some(err) = result.error {
            self.toast(ToastLevel::Error, format!("Media download failed: {err}"));
            return;
        }
        let Some(entry) = result.entry else {
            return;
        };
        match self.build_kitty_image(&entry) {
            Ok(image) => {
                self.current_image = Some(image);
                self.mark_dirty();
            }
            Err(err) => self.toast(ToastLevel::Error, format!("Media decode failed: {err}")),
        }
    }

    fn build_kitty_image(&mut self, entry: &media::CachedMedia) -> Result<KittyImage> {
        let bytes = std::fs::read(&entry.file_path).context("read cached media")?;
        let decoded = image::load_from_memory(&bytes).context("decode story image")?;
        let mut png = Vec::new();
        decoded
            .write_to(&mut io::Cursor::new(&mut png), image::ImageFormat::Png)
            .context("encode story image")?;

        let area = self.media_area.unwrap_or(Rect::new(0, 0, 40, 20));
        let ws = window_size().unwrap_or(WindowSize {
            rows: 0,
            columns: 0,
            width: 0,
            height: 0,
        });
        let (cols, rows) = fit_cells(
            (decoded.width(), decoded.height()),
            (area.width, area.height),
            cell_pixel_size(&ws),
        );

        let id = self.next_kitty_id;
        self.next_kitty_id = self.next_kitty_id.wrapping_add(1).max(1);
        Ok(KittyImage {
            id,
            payload: general_purpose::STANDARD.encode(&png),
            cols,
            rows,
            transmitted: false,
        })
    }

    fn flush_inline_images(&mut self, backend: &mut CrosstermBackend<Stdout>) -> io::Result<()> {
        let mut flushed = false;
        for sequence in self.pending_kitty_deletes.drain(..) {
            crossterm::queue!(backend, Print(sequence))?;
            flushed = true;
        }
        if let (Some(image), Some(area)) = (self.current_image.as_mut(), self.media_area) {
            if !image.transmitted {
                let x = area.x + (area.width.saturating_sub(image.cols)) / 2;
                let y = area.y + (area.height.saturating_sub(image.rows)) / 2;
                let sequence = image.transmit_sequence();
                crossterm::queue!(backend, MoveTo(x, y), Print(sequence))?;
                image.transmitted = true;
                flushed = true;
            }
        }
        if flushed {
            backend.flush()?;
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        stdout.execute(EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        self.teardown_playback();
        let _ = self.flush_inline_images(terminal.backend_mut());
        disable_raw_mode()?;
        terminal.backend_mut().execute(DisableMouseCapture)?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            // The active segment animates continuously while a session is
            // open, so redraw on every tick during playback.
            if self.viewer.is_open() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| {
                    let area = frame.size();
                    draw(self, frame, area);
                })?;
                self.flush_inline_images(terminal.backend_mut())?;
                self.needs_redraw = false;
            }

            self.ensure_video_session();

            let timeout = TICK_RATE
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.toast(ToastLevel::Error, format!("Error: {err}"));
                            }
                        }
                    }
                    Event::Mouse(mouse) => self.handle_mouse(mouse),
                    _ => {}
                }
            }

            if self.poll_async() {
                self.mark_dirty();
            }

            if last_tick.elapsed() >= TICK_RATE {
                last_tick = Instant::now();
                self.on_tick();
            }
        }

        Ok(())
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        let step = self.viewer.tick(now);
        if step != Transition::Unchanged {
            self.apply_transition(step);
        }

        self.poll_video();

        if self.toast.as_ref().is_some_and(|toast| toast.expired(now)) {
            self.toast = None;
            self.mark_dirty();
        }

        if self.is_loading() {
            if self.spinner.advance() {
                self.mark_dirty();
            }
        } else {
            self.spinner.reset();
        }
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        if self.viewer.is_open() {
            self.handle_viewer_key(code);
            return Ok(false);
        }

        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Tab | KeyCode::BackTab => {
                self.focused_pane = match self.focused_pane {
                    Pane::Reels => Pane::Posts,
                    Pane::Posts => Pane::Reels,
                };
                self.mark_dirty();
            }
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::Char('r') | KeyCode::Char('R') => self.reload_feed(),
            KeyCode::Char('o') if self.focused_pane == Pane::Posts => {
                self.open_selected_post_media()
            }
            KeyCode::Enter => match self.focused_pane {
                Pane::Reels => self.open_selected_reel(),
                Pane::Posts => self.toggle_like_selected(),
            },
            _ => {}
        }
        Ok(false)
    }

    fn handle_viewer_key(&mut self, code: KeyCode) {
        let now = Instant::now();
        match code {
            KeyCode::Esc | KeyCode::Char('q') => {
                let step = self.viewer.close();
                self.apply_transition(step);
            }
            KeyCode::Right | KeyCode::Char('l') | KeyCode::Char('n') => {
                let step = self.viewer.advance(now);
                self.apply_transition(step);
            }
            KeyCode::Left | KeyCode::Char('h') | KeyCode::Char('p') => {
                let step = self.viewer.retreat(now);
                self.apply_transition(step);
            }
            KeyCode::Char('d') => self.delete_current_story(),
            KeyCode::Char('o') => self.open_current_in_browser(),
            KeyCode::Char('a') => self.open_author_pic_in_browser(),
            KeyCode::Char(' ') => {
                if let Some((_, session)) = self.video_session.as_ref() {
                    if let Err(err) = session.send_command(video::VideoCommand::TogglePause) {
                        self.toast(ToastLevel::Error, format!("Pause failed: {err}"));
                    }
                } else {
                    self.toast(ToastLevel::Info, "Images advance on their own timer.");
                }
            }
            _ => {}
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        if !matches!(mouse.kind, MouseEventKind::Down(MouseButton::Left)) {
            return;
        }
        if !self.viewer.is_open() {
            return;
        }
        let Some(area) = self.media_area else {
            return;
        };
        let now = Instant::now();
        match nav_action(mouse.column, mouse.row, area) {
            Some(NavAction::Retreat) => {
                let step = self.viewer.retreat(now);
                self.apply_transition(step);
            }
            Some(NavAction::Advance) => {
                let step = self.viewer.advance(now);
                self.apply_transition(step);
            }
            None => {}
        }
    }

    fn move_selection(&mut self, delta: isize) {
        let (selected, len) = match self.focused_pane {
            Pane::Reels => (&mut self.selected_reel, self.reels.len()),
            Pane::Posts => (&mut self.selected_post, self.posts.len()),
        };
        if len == 0 {
            return;
        }
        let current = *selected as isize;
        let next = (current + delta).clamp(0, len as isize - 1);
        *selected = next as usize;
        self.mark_dirty();
    }
}

fn draw(model: &mut Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    frame.render_widget(
        Block::default().style(Style::default().bg(palette.bg)),
        area,
    );

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(area);

    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
        .split(rows[0]);

    draw_reels(model, frame, panes[0]);
    draw_posts(model, frame, panes[1]);
    draw_status(model, frame, rows[1]);

    if model.viewer.is_open() {
        draw_viewer(model, frame, area);
    } else {
        model.media_area = None;
    }
}

fn pane_block(title: &str, focused: bool, palette: Palette) -> Block<'_> {
    let border = if focused {
        palette.border_focused
    } else {
        palette.border_idle
    };
    Block::default()
        .title(format!(" {title} "))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .style(Style::default().bg(palette.panel_bg))
}

fn draw_reels(model: &Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    let focused = model.focused_pane == Pane::Reels;
    let items: Vec<ListItem<'_>> = model
        .reels
        .iter()
        .map(|reel| {
            let owner = if reel.is_owner { " (you)" } else { "" };
            let count = reel.stories.len();
            let noun = if count == 1 { "story" } else { "stories" };
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{}{}", reel.author, owner),
                    Style::default().fg(palette.text_primary),
                ),
                Span::styled(
                    format!("  {count} {noun}"),
                    Style::default().fg(palette.text_secondary),
                ),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(pane_block(Pane::Reels.title(), focused, palette))
        .highlight_style(
            Style::default()
                .fg(palette.accent)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▶ ");
    let mut state = ListState::default();
    if !model.reels.is_empty() {
        state.select(Some(model.selected_reel));
    }
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_posts(model: &Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    let focused = model.focused_pane == Pane::Posts;
    let block = pane_block(Pane::Posts.title(), focused, palette);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let sections = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(inner);

    let width = sections[0].width.saturating_sub(2) as usize;
    let items: Vec<ListItem<'_>> = model
        .posts
        .iter()
        .map(|post| {
            let heart = if post.liked { "♥" } else { "♡" };
            let heart_style = if post.liked {
                Style::default().fg(palette.error)
            } else {
                Style::default().fg(palette.text_secondary)
            };
            let text = truncate_to_width(
                &format!("{}: {}", post.author, post.caption),
                width.saturating_sub(6),
            );
            ListItem::new(Line::from(vec![
                Span::styled(format!("{heart} {:<3} ", post.likes_count), heart_style),
                Span::styled(text, Style::default().fg(palette.text_primary)),
            ]))
        })
        .collect();

    let list = List::new(items)
        .highlight_style(
            Style::default()
                .fg(palette.accent)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▶ ");
    let mut state = ListState::default();
    if !model.posts.is_empty() {
        state.select(Some(model.selected_post));
    }
    frame.render_stateful_widget(list, sections[0], &mut state);

    if let Some(post) = model.posts.get(model.selected_post) {
        let wrapped = textwrap::wrap(&post.caption, sections[1].width.max(1) as usize);
        let lines: Vec<Line<'_>> = wrapped
            .into_iter()
            .take(sections[1].height as usize)
            .map(|line| {
                Line::from(Span::styled(
                    line.into_owned(),
                    Style::default().fg(palette.text_secondary),
                ))
            })
            .collect();
        frame.render_widget(Paragraph::new(lines), sections[1]);
    }
}

fn draw_status(model: &Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    let mut spans = Vec::new();
    if model.is_loading() {
        spans.push(Span::styled(
            format!("{} ", model.spinner.frame()),
            Style::default().fg(palette.accent),
        ));
    }
    match model.toast.as_ref() {
        Some(toast) => {
            let color = match toast.level {
                ToastLevel::Info => palette.accent,
                ToastLevel::Success => palette.success,
                ToastLevel::Error => palette.error,
            };
            spans.push(Span::styled(
                toast.text.clone(),
                Style::default().fg(color),
            ));
        }
        None => {
            spans.push(Span::styled(
                model.status_message.clone(),
                Style::default().fg(palette.text_secondary),
            ));
            spans.push(Span::styled(
                format!("  ({})", model.config_path),
                Style::default().fg(palette.border_idle),
            ));
        }
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn overlay_rect(area: Rect) -> Rect {
    let width = (u32::from(area.width) * 3 / 5).clamp(20, u32::from(area.width)) as u16;
    let height = (u32::from(area.height) * 4 / 5).clamp(10, u32::from(area.height)) as u16;
    Rect::new(
        area.x + (area.width.saturating_sub(width)) / 2,
        area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    )
}

fn draw_viewer(model: &mut Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    let overlay = overlay_rect(area);
    frame.render_widget(Clear, overlay);

    let author = model.viewer.author().unwrap_or("stories").to_string();
    let position = model
        .viewer
        .cursor()
        .map(|cursor| position_label(cursor, model.viewer.len()))
        .unwrap_or_default();
    let block = Block::default()
        .title(format!(" {author} · {position} "))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(palette.border_focused))
        .style(Style::default().bg(palette.bg));
    let inner = block.inner(overlay);
    frame.render_widget(block, overlay);

    let sections = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(inner);

    draw_progress_row(model, frame, sections[0]);

    // The media region doubles as the navigation hit-zones: the draw pass
    // registers its geometry for the mouse handler and the video spawn.
    model.media_area = Some(sections[1]);
    draw_media_placeholder(model, frame, sections[1]);

    let mut hints = vec!["←/→ navigate", "Esc close", "o browser", "a profile"];
    if model
        .video_session
        .as_ref()
        .is_some_and(|(_, session)| session.controls_supported())
    {
        hints.push("Space pause");
    }
    if model.viewer.delete_target().is_some() {
        hints.push("d delete");
    }
    frame.render_widget(
        Paragraph::new(Line::from(Span::styled(
            hints.join(" · "),
            Style::default().fg(palette.text_secondary),
        )))
        .alignment(Alignment::Center),
        sections[2],
    );
}

fn draw_progress_row(model: &Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    let segments = model.viewer.segments(Instant::now());
    if segments.is_empty() || area.width == 0 {
        return;
    }
    let count = segments.len() as u16;
    let gaps = count.saturating_sub(1);
    let per_segment = (area.width.saturating_sub(gaps) / count).max(1);

    let mut spans = Vec::new();
    for (index, segment) in segments.iter().enumerate() {
        if index > 0 {
            spans.push(Span::raw(" "));
        }
        let filled = segment_fill_cells(per_segment, *segment);
        if filled > 0 {
            spans.push(Span::styled(
                "█".repeat(filled as usize),
                Style::default().fg(palette.text_primary),
            ));
        }
        if filled < per_segment {
            spans.push(Span::styled(
                "░".repeat((per_segment - filled) as usize),
                Style::default().fg(palette.segment_empty),
            ));
        }
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn draw_media_placeholder(model: &Model, frame: &mut Frame<'_>, area: Rect) {
    let palette = model.palette;
    // Images are painted over this region via the kitty protocol and
    // videos by mpv; the placeholder only shows while media is loading.
    let Some(item) = model.viewer.current() else {
        return;
    };
    if model.current_image.is_some() || model.video_session.is_some() {
        return;
    }
    let label = match item.kind() {
        MediaKind::Video => format!("▷ {}", item.filename),
        MediaKind::Image => format!("… {}", item.filename),
    };
    let vertical_pad = area.height / 2;
    let mut lines = vec![Line::default(); vertical_pad as usize];
    lines.push(Line::from(Span::styled(
        label,
        Style::default().fg(palette.text_secondary),
    )));
    frame.render_widget(
        Paragraph::new(lines)
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true }),
        area,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_left_half_retreats_and_right_half_advances() {
        let area = Rect::new(10, 5, 20, 10);
        assert_eq!(nav_action(10, 6, area), Some(NavAction::Retreat));
        assert_eq!(nav_action(19, 6, area), Some(NavAction::Retreat));
        assert_eq!(nav_action(20, 6, area), Some(NavAction::Advance));
        assert_eq!(nav_action(29, 14, area), Some(NavAction::Advance));
    }

    #[test]
    fn click_outside_media_region_does_nothing() {
        let area = Rect::new(10, 5, 20, 10);
        assert_eq!(nav_action(9, 6, area), None);
        assert_eq!(nav_action(30, 6, area), None);
        assert_eq!(nav_action(15, 4, area), None);
        assert_eq!(nav_action(15, 15, area), None);
    }

    #[test]
    fn segment_fill_maps_states_to_cells() {
        assert_eq!(segment_fill_cells(10, Segment::Filled), 10);
        assert_eq!(segment_fill_cells(10, Segment::Empty), 0);
        assert_eq!(
            segment_fill_cells(10, Segment::Animating { fraction: 0.5 }),
            5
        );
        assert_eq!(
            segment_fill_cells(10, Segment::Animating { fraction: 0.0 }),
            0
        );
        assert_eq!(
            segment_fill_cells(10, Segment::Animating { fraction: 1.0 }),
            10
        );
    }

    #[test]
    fn theme_name_selects_the_palette() {
        let dark = Palette::named("default");
        assert_eq!(Palette::named("unknown-theme"), dark);
        assert_eq!(Palette::named(""), dark);

        let light = Palette::named("latte");
        assert_ne!(light, dark);
        assert_eq!(Palette::named("  Latte "), light);
        assert_eq!(Palette::named("light"), light);
    }

    #[test]
    fn media_reply_with_a_stale_tag_is_dropped() {
        let mut model = Model::new(Options {
            status_message: String::new(),
            theme: String::new(),
            feed_service: None,
            story_service: None,
            interaction_service: None,
            feed_client: None,
            media_handle: None,
            mpv_path: "mpv".into(),
            user_agent: "test".into(),
            config_path: String::new(),
        });
        // The closed viewer sits at generation 0; a reply tagged for a
        // later generation must not become the shown image.
        model.pending_image = Some(3);
        model.toast = None;
        model.apply_media_response(media::ResultEntry {
            tag: 3,
            entry: None,
            error: Some(anyhow::anyhow!("fetch failed")),
        });
        assert_eq!(model.pending_image, Some(3));
        assert!(model.current_image.is_none());
        assert!(model.toast.is_none());
    }

    #[test]
    fn toast_expires_after_its_ttl() {
        let shown_at = Instant::now();
        let toast = Toast {
            text: "saved".into(),
            level: ToastLevel::Success,
            shown_at,
        };
        assert!(!toast.expired(shown_at + Duration::from_secs(4)));
        assert!(toast.expired(shown_at + TOAST_TTL));
    }

    #[test]
    fn position_label_is_one_based() {
        assert_eq!(position_label(0, 3), "1/3");
        assert_eq!(position_label(2, 3), "3/3");
    }

    #[test]
    fn truncate_preserves_short_text() {
        assert_eq!(truncate_to_width("hello", 10), "hello");
        let truncated = truncate_to_width("a very long caption indeed", 10);
        assert!(UnicodeWidthStr::width(truncated.as_str()) <= 10);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn fit_cells_respects_the_region_bounds() {
        let (cols, rows) = fit_cells((800, 600), (40, 20), (8, 16));
        assert!(cols <= 40);
        assert!(rows <= 20);
        // Small images are not scaled up.
        let (cols, rows) = fit_cells((16, 16), (40, 20), (8, 16));
        assert_eq!(cols, 2);
        assert_eq!(rows, 1);
    }

    #[test]
    fn kitty_transmission_is_chunked_and_terminated() {
        let image = KittyImage {
            id: 7,
            payload: "A".repeat(KITTY_CHUNK_SIZE + 10),
            cols: 4,
            rows: 2,
            transmitted: false,
        };
        let sequence = image.transmit_sequence();
        assert!(sequence.starts_with("\x1b_Gf=100,a=T,i=7,q=2,c=4,r=2,m=1;"));
        assert!(sequence.contains("\x1b_Gm=0;"));
        assert!(sequence.ends_with("\x1b\\"));
        assert_eq!(KittyImage::delete_sequence(7), "\x1b_Ga=d,d=i,i=7,q=2\x1b\\");
    }

    #[test]
    fn overlay_rect_is_centered_within_the_frame() {
        let overlay = overlay_rect(Rect::new(0, 0, 100, 50));
        assert!(overlay.width <= 100);
        assert!(overlay.height <= 50);
        assert_eq!(overlay.x, (100 - overlay.width) / 2);
    }
}
