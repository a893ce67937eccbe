use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Fixed per-item playback window. Images advance when it expires; the
/// progress segment of a video item animates over the same window even
/// though the video itself advances on its real end-of-playback.
pub const ITEM_DURATION: Duration = Duration::from_secs(7);

/// Stories disappear from reels 24 hours after posting.
pub const ACTIVE_WINDOW: chrono::Duration = chrono::Duration::seconds(86_400);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoryError {
    #[error("reel has no items")]
    EmptyReel,
    #[error("story index {index} out of range for reel of {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Classify a story by filename extension. Anything that is not a known
/// video container counts as an image, including a missing extension.
pub fn classify(filename: &str) -> MediaKind {
    let ext = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if ext.eq_ignore_ascii_case("mp4")
        || ext.eq_ignore_ascii_case("mov")
        || ext.eq_ignore_ascii_case("avi")
    {
        MediaKind::Video
    } else {
        MediaKind::Image
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoryItem {
    pub id: i64,
    pub filename: String,
    pub posted_at: Option<DateTime<Utc>>,
}

impl StoryItem {
    pub fn kind(&self) -> MediaKind {
        classify(&self.filename)
    }

    /// Whether the story is still inside its 24-hour window. Items without
    /// a timestamp are treated as active; the server already filtered them.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.posted_at {
            Some(posted_at) => now.signed_duration_since(posted_at) < ACTIVE_WINDOW,
            None => true,
        }
    }
}

/// The ordered items of one author's reel. Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct StoryQueue {
    items: Vec<StoryItem>,
}

impl StoryQueue {
    pub fn new(items: Vec<StoryItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&StoryItem, StoryError> {
        self.items.get(index).ok_or(StoryError::IndexOutOfRange {
            index,
            len: self.items.len(),
        })
    }

    pub fn items(&self) -> &[StoryItem] {
        &self.items
    }
}

/// Payload that opens the viewer: one author's reel plus display metadata.
#[derive(Debug, Clone)]
pub struct AuthorReel {
    pub author: String,
    pub author_pic: String,
    pub is_owner: bool,
    pub items: Vec<StoryItem>,
}

/// One progress segment, left to right across the reel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment {
    Filled,
    Animating { fraction: f64 },
    Empty,
}

/// What a transition asks the surrounding view to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Show the item now at this index; playback restarts from scratch.
    Show(usize),
    /// The session ended; hide the view and stop any playing media.
    Closed,
    /// Nothing changed.
    Unchanged,
}

struct Session {
    queue: StoryQueue,
    author: String,
    author_pic: String,
    is_owner: bool,
    cursor: usize,
    /// Armed only for image items; video items wait on end-of-playback.
    deadline: Option<Instant>,
    /// Reset on every render so the active segment always refills from 0%.
    animation_epoch: Instant,
}

impl Session {
    fn arm(&mut self, now: Instant) {
        let kind = self
            .queue
            .get(self.cursor)
            .map(StoryItem::kind)
            .unwrap_or(MediaKind::Image);
        self.deadline = match kind {
            MediaKind::Image => Some(now + ITEM_DURATION),
            MediaKind::Video => None,
        };
        self.animation_epoch = now;
    }
}

/// The playback controller. At most one session is open at a time, and the
/// session is only ever mutated through the transition methods below. The
/// generation token rises on every transition so expired timers and video
/// end events from a superseded item can be recognized and dropped.
pub struct Viewer {
    session: Option<Session>,
    generation: u64,
}

impl Default for Viewer {
    fn default() -> Self {
        Self::new()
    }
}

impl Viewer {
    pub fn new() -> Self {
        Self {
            session: None,
            generation: 0,
        }
    }

    /// Open a reel, replacing any session already showing. An empty reel is
    /// rejected and leaves the viewer closed rather than entering an
    /// invalid cursor state.
    pub fn open(&mut self, reel: AuthorReel, now: Instant) -> Result<Transition, StoryError> {
        self.generation = self.generation.wrapping_add(1);
        self.session = None;
        if reel.items.is_empty() {
            return Err(StoryError::EmptyReel);
        }
        let mut session = Session {
            queue: StoryQueue::new(reel.items),
            author: reel.author,
            author_pic: reel.author_pic,
            is_owner: reel.is_owner,
            cursor: 0,
            deadline: None,
            animation_epoch: now,
        };
        session.arm(now);
        self.session = Some(session);
        Ok(Transition::Show(0))
    }

    /// Move to the next item, or close past the last one. Fired by manual
    /// navigation, image timer expiry, and video end-of-playback alike.
    pub fn advance(&mut self, now: Instant) -> Transition {
        let Some(session) = self.session.as_mut() else {
            return Transition::Unchanged;
        };
        self.generation = self.generation.wrapping_add(1);
        if session.cursor + 1 < session.queue.len() {
            session.cursor += 1;
            session.arm(now);
            Transition::Show(session.cursor)
        } else {
            self.session = None;
            Transition::Closed
        }
    }

    /// Move to the previous item. At the first item this is a no-op, not a
    /// close; the shown item and its running animation stay untouched.
    pub fn retreat(&mut self, now: Instant) -> Transition {
        let Some(session) = self.session.as_mut() else {
            return Transition::Unchanged;
        };
        if session.cursor == 0 {
            return Transition::Unchanged;
        }
        self.generation = self.generation.wrapping_add(1);
        session.cursor -= 1;
        session.arm(now);
        Transition::Show(session.cursor)
    }

    /// Tear the session down. Closing an already-closed viewer is a no-op.
    pub fn close(&mut self) -> Transition {
        if self.session.is_none() {
            return Transition::Unchanged;
        }
        self.generation = self.generation.wrapping_add(1);
        self.session = None;
        Transition::Closed
    }

    /// Drive the image timer. Call from the event loop; fires at most one
    /// advance per call and re-arms for the next item.
    pub fn tick(&mut self, now: Instant) -> Transition {
        match self.session.as_ref().and_then(|session| session.deadline) {
            Some(deadline) if now >= deadline => self.advance(now),
            _ => Transition::Unchanged,
        }
    }

    /// Report that a video finished playing. The generation it was started
    /// under is compared against the current one so an ending that raced a
    /// manual navigation or a close cannot advance stale state.
    pub fn video_ended(&mut self, generation: u64, now: Instant) -> Transition {
        if generation != self.generation {
            return Transition::Unchanged;
        }
        self.advance(now)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.session.as_ref().map(|session| session.cursor)
    }

    pub fn len(&self) -> usize {
        self.session
            .as_ref()
            .map(|session| session.queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current(&self) -> Option<&StoryItem> {
        let session = self.session.as_ref()?;
        session.queue.get(session.cursor).ok()
    }

    pub fn author(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.author.as_str())
    }

    pub fn author_pic(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.author_pic.as_str())
    }

    pub fn is_owner(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.is_owner)
            .unwrap_or(false)
    }

    /// Id of the item a delete would target: the currently shown one, and
    /// only when the session belongs to the signed-in user.
    pub fn delete_target(&self) -> Option<i64> {
        let session = self.session.as_ref()?;
        if !session.is_owner {
            return None;
        }
        Some(session.queue.get(session.cursor).ok()?.id)
    }

    pub fn timer_armed(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.deadline.is_some())
            .unwrap_or(false)
    }

    /// Progress segments for the open session: filled before the cursor,
    /// empty after it, and the active one filling over [`ITEM_DURATION`]
    /// measured from the last render.
    pub fn segments(&self, now: Instant) -> Vec<Segment> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let elapsed = now.saturating_duration_since(session.animation_epoch);
        let fraction = (elapsed.as_secs_f64() / ITEM_DURATION.as_secs_f64()).clamp(0.0, 1.0);
        (0..session.queue.len())
            .map(|index| {
                if index < session.cursor {
                    Segment::Filled
                } else if index == session.cursor {
                    Segment::Animating { fraction }
                } else {
                    Segment::Empty
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, filename: &str) -> StoryItem {
        StoryItem {
            id,
            filename: filename.to_string(),
            posted_at: None,
        }
    }

    fn reel(items: Vec<StoryItem>) -> AuthorReel {
        AuthorReel {
            author: "ivy".into(),
            author_pic: "/static/profile_pics/ivy.png".into(),
            is_owner: false,
            items,
        }
    }

    fn owned_reel(items: Vec<StoryItem>) -> AuthorReel {
        AuthorReel {
            is_owner: true,
            ..reel(items)
        }
    }

    #[test]
    fn classifies_by_extension_case_insensitively() {
        assert_eq!(classify("clip.mp4"), MediaKind::Video);
        assert_eq!(classify("clip.MOV"), MediaKind::Video);
        assert_eq!(classify("clip.Avi"), MediaKind::Video);
        assert_eq!(classify("photo.jpg"), MediaKind::Image);
        assert_eq!(classify("photo.webm"), MediaKind::Image);
        assert_eq!(classify("noextension"), MediaKind::Image);
        assert_eq!(classify("archive.tar.mp4"), MediaKind::Video);
    }

    #[test]
    fn queue_access_out_of_range_fails_fast() {
        let queue = StoryQueue::new(vec![item(1, "a.jpg")]);
        assert!(queue.get(0).is_ok());
        assert_eq!(
            queue.get(1),
            Err(StoryError::IndexOutOfRange { index: 1, len: 1 })
        );
    }

    #[test]
    fn open_starts_at_zero_with_timer_armed() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        let step = viewer
            .open(reel(vec![item(1, "a.jpg"), item(2, "b.png")]), now)
            .unwrap();
        assert_eq!(step, Transition::Show(0));
        assert_eq!(viewer.cursor(), Some(0));
        assert!(viewer.timer_armed());
    }

    #[test]
    fn open_with_empty_reel_is_rejected() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        assert_eq!(viewer.open(reel(vec![]), now), Err(StoryError::EmptyReel));
        assert!(!viewer.is_open());
        assert!(!viewer.timer_armed());
    }

    #[test]
    fn video_items_arm_no_independent_timer() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer.open(reel(vec![item(1, "clip.mp4")]), now).unwrap();
        assert!(viewer.is_open());
        assert!(!viewer.timer_armed());
    }

    #[test]
    fn advancing_past_the_end_closes_after_exactly_remaining_items() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(
                reel(vec![item(1, "a.jpg"), item(2, "b.jpg"), item(3, "c.jpg")]),
                now,
            )
            .unwrap();
        assert_eq!(viewer.advance(now), Transition::Show(1));
        assert_eq!(viewer.advance(now), Transition::Show(2));
        assert_eq!(viewer.advance(now), Transition::Closed);
        assert!(!viewer.is_open());
        assert_eq!(viewer.advance(now), Transition::Unchanged);
    }

    #[test]
    fn single_item_advance_closes_instead_of_erroring() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer.open(reel(vec![item(1, "only.jpg")]), now).unwrap();
        assert_eq!(viewer.advance(now), Transition::Closed);
    }

    #[test]
    fn retreat_at_first_item_is_a_noop() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(reel(vec![item(1, "a.jpg"), item(2, "b.jpg")]), now)
            .unwrap();
        let generation = viewer.generation();
        assert_eq!(viewer.retreat(now), Transition::Unchanged);
        assert_eq!(viewer.cursor(), Some(0));
        assert_eq!(viewer.generation(), generation);
        assert!(viewer.is_open());
    }

    #[test]
    fn image_timer_fires_once_per_expiry() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(reel(vec![item(1, "a.jpg"), item(2, "b.jpg")]), now)
            .unwrap();
        assert_eq!(viewer.tick(now + Duration::from_secs(6)), Transition::Unchanged);
        let fired = now + ITEM_DURATION;
        assert_eq!(viewer.tick(fired), Transition::Show(1));
        // The fresh timer belongs to item 1 and is measured from the render.
        assert_eq!(viewer.tick(fired), Transition::Unchanged);
        assert_eq!(viewer.tick(fired + ITEM_DURATION), Transition::Closed);
    }

    #[test]
    fn tick_after_close_cannot_advance() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer.open(reel(vec![item(1, "a.jpg")]), now).unwrap();
        assert_eq!(viewer.close(), Transition::Closed);
        assert_eq!(
            viewer.tick(now + Duration::from_secs(60)),
            Transition::Unchanged
        );
    }

    #[test]
    fn close_is_idempotent() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer.open(reel(vec![item(1, "a.jpg")]), now).unwrap();
        assert_eq!(viewer.close(), Transition::Closed);
        assert_eq!(viewer.close(), Transition::Unchanged);
    }

    #[test]
    fn stale_video_end_is_discarded() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(reel(vec![item(1, "a.mp4"), item(2, "b.jpg")]), now)
            .unwrap();
        let armed_generation = viewer.generation();
        assert_eq!(viewer.advance(now), Transition::Show(1));
        // The ending that raced the manual advance arrives late.
        assert_eq!(
            viewer.video_ended(armed_generation, now),
            Transition::Unchanged
        );
        assert_eq!(viewer.cursor(), Some(1));
    }

    #[test]
    fn current_video_end_advances() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer.open(reel(vec![item(1, "a.mp4")]), now).unwrap();
        assert_eq!(
            viewer.video_ended(viewer.generation(), now),
            Transition::Closed
        );
    }

    #[test]
    fn reopening_supersedes_the_previous_session() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(
                reel(vec![item(1, "a.jpg"), item(2, "b.jpg"), item(3, "c.jpg")]),
                now,
            )
            .unwrap();
        viewer.advance(now);
        viewer.advance(now);
        assert_eq!(viewer.cursor(), Some(2));
        let old_generation = viewer.generation();

        let step = viewer.open(reel(vec![item(9, "z.mp4")]), now).unwrap();
        assert_eq!(step, Transition::Show(0));
        assert_eq!(viewer.cursor(), Some(0));
        assert_eq!(viewer.len(), 1);
        // Neither the old timer nor an old video ending can fire now.
        assert_eq!(
            viewer.tick(now + Duration::from_secs(60)),
            Transition::Unchanged
        );
        assert_eq!(
            viewer.video_ended(old_generation, now),
            Transition::Unchanged
        );
    }

    #[test]
    fn segments_reflect_the_cursor_position() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(
                reel(vec![item(1, "a.jpg"), item(2, "b.jpg"), item(3, "c.jpg")]),
                now,
            )
            .unwrap();
        viewer.advance(now);
        let segments = viewer.segments(now);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Filled);
        assert!(matches!(segments[1], Segment::Animating { .. }));
        assert_eq!(segments[2], Segment::Empty);
    }

    #[test]
    fn active_segment_fraction_tracks_elapsed_time() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer.open(reel(vec![item(1, "a.jpg")]), now).unwrap();
        let at = |seconds: f64| {
            let segments = viewer.segments(now + Duration::from_secs_f64(seconds));
            match segments[0] {
                Segment::Animating { fraction } => fraction,
                other => panic!("expected animating segment, got {other:?}"),
            }
        };
        assert!(at(0.0).abs() < 1e-9);
        assert!((at(3.5) - 0.5).abs() < 1e-9);
        assert!((at(10.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rerender_restarts_the_active_segment_from_empty() {
        let start = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(reel(vec![item(1, "a.jpg"), item(2, "b.jpg")]), start)
            .unwrap();
        let later = start + Duration::from_secs(5);
        assert_eq!(viewer.advance(later), Transition::Show(1));
        let back = later + Duration::from_secs(3);
        assert_eq!(viewer.retreat(back), Transition::Show(0));
        // Item 0 was shown before, but its animation starts over.
        match viewer.segments(back)[0] {
            Segment::Animating { fraction } => assert!(fraction.abs() < 1e-9),
            other => panic!("expected animating segment, got {other:?}"),
        }
    }

    #[test]
    fn delete_targets_the_shown_item_only_for_owners() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(owned_reel(vec![item(1, "a.jpg"), item(2, "b.mp4")]), now)
            .unwrap();
        assert_eq!(viewer.delete_target(), Some(1));
        viewer.advance(now);
        assert_eq!(viewer.delete_target(), Some(2));

        viewer
            .open(reel(vec![item(3, "c.jpg")]), now)
            .unwrap();
        assert_eq!(viewer.delete_target(), None);
    }

    #[test]
    fn scenario_image_then_video_reel() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        let step = viewer
            .open(owned_reel(vec![item(1, "a.jpg"), item(2, "b.mp4")]), now)
            .unwrap();
        assert_eq!(step, Transition::Show(0));
        assert_eq!(viewer.current().unwrap().kind(), MediaKind::Image);
        assert_eq!(viewer.delete_target(), Some(1));
        assert!(viewer.timer_armed());

        assert_eq!(viewer.tick(now + ITEM_DURATION), Transition::Show(1));
        assert_eq!(viewer.current().unwrap().kind(), MediaKind::Video);
        assert_eq!(viewer.delete_target(), Some(2));
        assert!(!viewer.timer_armed());

        assert_eq!(
            viewer.video_ended(viewer.generation(), now + ITEM_DURATION),
            Transition::Closed
        );
        assert!(!viewer.is_open());
    }

    #[test]
    fn cursor_stays_in_bounds_while_open() {
        let now = Instant::now();
        let mut viewer = Viewer::new();
        viewer
            .open(reel(vec![item(1, "a.jpg"), item(2, "b.jpg")]), now)
            .unwrap();
        for _ in 0..10 {
            viewer.retreat(now);
            if let Some(cursor) = viewer.cursor() {
                assert!(cursor < viewer.len());
            }
        }
        while viewer.is_open() {
            let cursor = viewer.cursor().unwrap();
            assert!(cursor < viewer.len());
            viewer.advance(now);
        }
    }

    #[test]
    fn story_active_window_is_24_hours() {
        let now = Utc::now();
        let fresh = StoryItem {
            posted_at: Some(now - chrono::Duration::hours(23)),
            ..item(1, "a.jpg")
        };
        let expired = StoryItem {
            posted_at: Some(now - chrono::Duration::hours(25)),
            ..item(2, "b.jpg")
        };
        assert!(fresh.is_active(now));
        assert!(!expired.is_active(now));
        assert!(item(3, "c.jpg").is_active(now));
    }
}
