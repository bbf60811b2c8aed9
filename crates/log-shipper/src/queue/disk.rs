// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment-file backed queue.
//!
//! # On-disk layout
//!
//! ```text
//!   <dir>/segment-00000000000000000003.dat   oldest segment still holding items
//!   <dir>/segment-00000000000000000004.dat
//!   <dir>/segment-00000000000000000005.dat   tail, appended to
//!   <dir>/head                               "<segment index> <acked items in it>"
//! ```
//!
//! Each segment holds at most `segment_size` items, framed as a little endian
//! `u32` length followed by the payload. Only the head segment is held in
//! memory. Acknowledging an item rewrites the head marker; a segment file is
//! deleted once every item in it is acknowledged and the tail has moved on.
//!
//! A crash between a successful push to the backend and the marker update
//! replays that item after restart, never loses it.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::{DurableQueue, QueueError, QueuedItem};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".dat";
const HEAD_MARKER: &str = "head";
const FRAME_HEADER_LEN: usize = 4;
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskQueueConfig {
    pub dir: PathBuf,
    /// Maximum number of items per segment file.
    pub segment_size: usize,
    /// Maximum number of segment files before pushes are rejected.
    pub max_segments: usize,
    /// `fsync` after every write.
    pub sync: bool,
}

#[derive(Debug)]
struct DiskState {
    head_index: u64,
    head_consumed: usize,
    head_items: VecDeque<Vec<u8>>,
    tail_index: u64,
    tail_count: usize,
    tail_file: Option<File>,
    len: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct DiskQueue {
    config: DiskQueueConfig,
    state: Mutex<DiskState>,
}

impl DiskQueue {
    /// Opens the queue stored in `config.dir`, recovering any items left by a
    /// previous process.
    pub fn open(config: DiskQueueConfig) -> Result<Self, QueueError> {
        let config = DiskQueueConfig {
            segment_size: config.segment_size.max(1),
            max_segments: config.max_segments.max(2),
            ..config
        };
        fs::create_dir_all(&config.dir)?;

        let mut indices = list_segments(&config.dir)?;
        let marker = read_marker(&config.dir)?;
        let (marker_index, marker_consumed) =
            marker.unwrap_or((indices.first().copied().unwrap_or(0), 0));

        for stale in indices.iter().filter(|index| **index < marker_index) {
            debug!("QUEUE | Removing fully acknowledged segment {stale}");
            fs::remove_file(segment_path(&config.dir, *stale))?;
        }
        indices.retain(|index| *index >= marker_index);
        if indices.is_empty() {
            File::create(segment_path(&config.dir, marker_index))?;
            indices.push(marker_index);
        }

        let head_index = indices[0];
        let head_consumed = if head_index == marker_index {
            marker_consumed
        } else {
            0
        };

        let mut len = 0;
        let mut tail_count = 0;
        let mut head_items = VecDeque::new();
        for (position, index) in indices.iter().enumerate() {
            let frames = read_segment(&segment_path(&config.dir, *index))?;
            tail_count = frames.len();
            if position == 0 {
                head_items = frames.into_iter().skip(head_consumed).collect();
                len += head_items.len();
            } else {
                len += tail_count;
            }
        }

        let tail_index = indices[indices.len() - 1];
        let tail_file = OpenOptions::new()
            .append(true)
            .open(segment_path(&config.dir, tail_index))?;

        if len > 0 {
            debug!(
                "QUEUE | Recovered {len} queued items from {}",
                config.dir.display()
            );
        }

        Ok(DiskQueue {
            config,
            state: Mutex::new(DiskState {
                head_index,
                head_consumed,
                head_items,
                tail_index,
                tail_count,
                tail_file: Some(tail_file),
                len,
                closed: false,
            }),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn head_id(&self, state: &DiskState) -> u64 {
        state.head_index * self.config.segment_size as u64 + state.head_consumed as u64
    }

    fn segment_count(state: &DiskState) -> usize {
        usize::try_from(state.tail_index - state.head_index + 1).unwrap_or(usize::MAX)
    }

    fn roll_tail(&self, state: &mut DiskState) -> Result<(), QueueError> {
        if let Some(file) = state.tail_file.as_ref() {
            if self.config.sync {
                file.sync_all()?;
            }
        }
        let next = state.tail_index + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.config.dir, next))?;
        state.tail_file = Some(file);
        state.tail_index = next;
        state.tail_count = 0;
        Ok(())
    }

    /// Moves the head to the next segment while the current one is drained
    /// and no longer appended to.
    fn advance_head(&self, state: &mut DiskState) -> Result<(), QueueError> {
        while state.head_items.is_empty() && state.head_index < state.tail_index {
            fs::remove_file(segment_path(&self.config.dir, state.head_index))?;
            state.head_index += 1;
            state.head_consumed = 0;
            state.head_items = read_segment(&segment_path(&self.config.dir, state.head_index))?
                .into_iter()
                .collect();
            write_marker(&self.config.dir, state.head_index, 0, self.config.sync)?;
        }
        Ok(())
    }
}

impl DurableQueue for DiskQueue {
    fn push(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(QueueError::Corrupt(format!(
                "item of {} bytes exceeds the {MAX_FRAME_BYTES} byte frame limit",
                payload.len()
            )));
        }
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.tail_count >= self.config.segment_size {
            if Self::segment_count(&state) >= self.config.max_segments {
                return Err(QueueError::Full);
            }
            self.roll_tail(&mut state)?;
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        let sync = self.config.sync;
        let file = state.tail_file.as_mut().ok_or(QueueError::Closed)?;
        file.write_all(&frame)?;
        if sync {
            file.sync_data()?;
        }

        state.tail_count += 1;
        state.len += 1;
        if state.tail_index == state.head_index {
            state.head_items.push_back(payload);
        }
        Ok(())
    }

    fn pop(&self) -> Result<Option<QueuedItem>, QueueError> {
        let mut state = self.lock();
        self.advance_head(&mut state)?;
        let id = self.head_id(&state);
        Ok(state.head_items.front().map(|payload| QueuedItem {
            id,
            payload: payload.clone(),
        }))
    }

    fn ack(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        self.advance_head(&mut state)?;
        let expected = (!state.head_items.is_empty()).then(|| self.head_id(&state));
        if expected != Some(id) {
            return Err(QueueError::UnexpectedAck { expected, got: id });
        }

        write_marker(
            &self.config.dir,
            state.head_index,
            state.head_consumed + 1,
            self.config.sync,
        )?;
        state.head_items.pop_front();
        state.head_consumed += 1;
        state.len -= 1;
        self.advance_head(&mut state)
    }

    fn len(&self) -> usize {
        self.lock().len
    }

    fn is_full(&self) -> bool {
        let state = self.lock();
        state.tail_count >= self.config.segment_size
            && Self::segment_count(&state) >= self.config.max_segments
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn close(&self) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.closed = true;
        if let Some(file) = state.tail_file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index:020}{SEGMENT_SUFFIX}"))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, QueueError> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn read_marker(dir: &Path) -> Result<Option<(u64, usize)>, QueueError> {
    let path = dir.join(HEAD_MARKER);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut parts = raw.split_whitespace();
    match (
        parts.next().and_then(|p| p.parse::<u64>().ok()),
        parts.next().and_then(|p| p.parse::<usize>().ok()),
    ) {
        (Some(index), Some(consumed)) => Ok(Some((index, consumed))),
        _ => Err(QueueError::Corrupt(format!(
            "unreadable head marker {:?} in {}",
            raw.trim(),
            dir.display()
        ))),
    }
}

fn write_marker(dir: &Path, index: u64, consumed: usize, sync: bool) -> Result<(), QueueError> {
    let tmp = dir.join(format!("{HEAD_MARKER}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(format!("{index} {consumed}\n").as_bytes())?;
    if sync {
        file.sync_all()?;
    }
    fs::rename(tmp, dir.join(HEAD_MARKER))?;
    Ok(())
}

/// Reads every complete frame of a segment. A torn frame at the end, left by
/// a crash mid-write, is cut off so that appends continue from a clean
/// boundary.
fn read_segment(path: &Path) -> Result<Vec<Vec<u8>>, QueueError> {
    let mut raw = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut raw)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + FRAME_HEADER_LEN <= raw.len() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&raw[offset..offset + FRAME_HEADER_LEN]);
        let frame_len = u32::from_le_bytes(header) as usize;
        let start = offset + FRAME_HEADER_LEN;
        if frame_len > MAX_FRAME_BYTES || start + frame_len > raw.len() {
            break;
        }
        frames.push(raw[start..start + frame_len].to_vec());
        offset = start + frame_len;
    }

    if offset < raw.len() {
        warn!(
            "QUEUE | Truncating {} trailing bytes of incomplete frame in {}",
            raw.len() - offset,
            path.display()
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(offset as u64)?;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, segment_size: usize, max_segments: usize) -> DiskQueueConfig {
        DiskQueueConfig {
            dir: dir.path().join("client"),
            segment_size,
            max_segments,
            sync: false,
        }
    }

    fn drain(queue: &DiskQueue) -> Vec<Vec<u8>> {
        let mut items = Vec::new();
        while let Some(item) = queue.pop().unwrap() {
            queue.ack(item.id).unwrap();
            items.push(item.payload);
        }
        items
    }

    #[test]
    fn test_push_pop_ack_in_order() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 2, 10)).unwrap();
        for i in 0..5u8 {
            queue.push(vec![i]).unwrap();
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(drain(&queue), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_without_ack_returns_same_item() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 4, 4)).unwrap();
        queue.push(b"first".to_vec()).unwrap();
        queue.push(b"second".to_vec()).unwrap();

        let a = queue.pop().unwrap().unwrap();
        let b = queue.pop().unwrap().unwrap();

        assert_eq!(a, b);
        assert_eq!(a.payload, b"first");
    }

    #[test]
    fn test_unacked_items_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = DiskQueue::open(config(&dir, 2, 10)).unwrap();
            for i in 0..5u8 {
                queue.push(vec![i]).unwrap();
            }
            let item = queue.pop().unwrap().unwrap();
            queue.ack(item.id).unwrap();
            // popped but never acknowledged: must come back after restart
            let in_flight = queue.pop().unwrap().unwrap();
            assert_eq!(in_flight.payload, vec![1]);
        }

        let queue = DiskQueue::open(config(&dir, 2, 10)).unwrap();

        assert_eq!(queue.len(), 4);
        assert_eq!(drain(&queue), vec![vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_acked_segments_are_deleted() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 2, 10)).unwrap();
        for i in 0..6u8 {
            queue.push(vec![i]).unwrap();
        }
        assert_eq!(list_segments(queue.dir()).unwrap().len(), 3);

        for _ in 0..4 {
            let item = queue.pop().unwrap().unwrap();
            queue.ack(item.id).unwrap();
        }

        assert_eq!(list_segments(queue.dir()).unwrap().len(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_when_segment_limit_reached() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 2, 2)).unwrap();
        for i in 0..4u8 {
            queue.push(vec![i]).unwrap();
        }

        assert!(queue.is_full());
        assert!(matches!(queue.push(vec![9]), Err(QueueError::Full)));

        // draining the head segment frees room for another one
        for _ in 0..2 {
            let item = queue.pop().unwrap().unwrap();
            queue.ack(item.id).unwrap();
        }
        queue.push(vec![9]).unwrap();
        assert_eq!(drain(&queue), vec![vec![2], vec![3], vec![9]]);
    }

    #[test]
    fn test_torn_frame_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 10, 10);
        {
            let queue = DiskQueue::open(cfg.clone()).unwrap();
            queue.push(b"complete".to_vec()).unwrap();
            queue.close().unwrap();
        }
        let tail = segment_path(&cfg.dir, 0);
        let mut file = OpenOptions::new().append(true).open(&tail).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let queue = DiskQueue::open(cfg).unwrap();
        queue.push(b"after".to_vec()).unwrap();

        assert_eq!(drain(&queue), vec![b"complete".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn test_failed_marker_write_keeps_item_at_head() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 4, 4)).unwrap();
        queue.push(b"kept".to_vec()).unwrap();
        let item = queue.pop().unwrap().unwrap();

        // a directory in place of the temp marker makes the write fail
        let blocker = queue.dir().join(format!("{HEAD_MARKER}.tmp"));
        fs::create_dir(&blocker).unwrap();
        assert!(matches!(queue.ack(item.id), Err(QueueError::Io(_))));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().unwrap(), item);

        fs::remove_dir(&blocker).unwrap();
        queue.ack(item.id).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wrong_ack_is_rejected() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 2, 2)).unwrap();
        queue.push(vec![1]).unwrap();

        assert!(matches!(
            queue.ack(5),
            Err(QueueError::UnexpectedAck { expected: Some(0), got: 5 })
        ));
        assert!(matches!(
            DiskQueue::open(config(&dir, 2, 2)).unwrap().ack(0),
            Ok(())
        ));
    }

    #[test]
    fn test_closed_queue_rejects_push() {
        let dir = TempDir::new().unwrap();
        let queue = DiskQueue::open(config(&dir, 2, 2)).unwrap();
        queue.close().unwrap();

        assert!(matches!(queue.push(vec![1]), Err(QueueError::Closed)));
        assert!(queue.is_durable());
    }
}
