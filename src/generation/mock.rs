//! Mock 媒体提供方（测试与离线运行）
//!
//! 每类调用各有一个脚本队列；队列空时返回一个固定的成功结果。记录调用次数供断言。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::generation::{
    ArtifactSource, MediaError, MediaProvider, OperationHandle, PollStatus, ReferenceMedia,
    VideoSubmission,
};

/// 离线占位图（PNG 文件头 + 标记）
pub const MOCK_IMAGE_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nmock-image";
/// 离线占位视频
pub const MOCK_VIDEO_BYTES: &[u8] = b"\x00\x00\x00\x18ftypmp42mock-video";

/// 脚本化媒体提供方
#[derive(Default)]
pub struct MockMediaProvider {
    images: Mutex<VecDeque<Result<Vec<u8>, MediaError>>>,
    submissions: Mutex<VecDeque<Result<VideoSubmission, MediaError>>>,
    polls: Mutex<VecDeque<Result<PollStatus, MediaError>>>,
    fetches: Mutex<VecDeque<Result<Vec<u8>, MediaError>>>,
    image_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

fn pop<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
}

fn push<T>(queue: &Mutex<VecDeque<T>>, item: T) {
    queue.lock().unwrap_or_else(|p| p.into_inner()).push_back(item);
}

impl MockMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_image(&self, result: Result<Vec<u8>, MediaError>) {
        push(&self.images, result);
    }

    pub fn push_submission(&self, result: Result<VideoSubmission, MediaError>) {
        push(&self.submissions, result);
    }

    pub fn push_poll(&self, result: Result<PollStatus, MediaError>) {
        push(&self.polls, result);
    }

    pub fn push_fetch(&self, result: Result<Vec<u8>, MediaError>) {
        push(&self.fetches, result);
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProvider for MockMediaProvider {
    async fn generate_image(&self, _prompt: &str) -> Result<Vec<u8>, MediaError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        pop(&self.images).unwrap_or_else(|| Ok(MOCK_IMAGE_BYTES.to_vec()))
    }

    async fn submit_video(
        &self,
        _prompt: &str,
        _reference: Option<&ReferenceMedia>,
    ) -> Result<VideoSubmission, MediaError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        pop(&self.submissions).unwrap_or_else(|| {
            Ok(VideoSubmission::Pending(OperationHandle {
                name: "operations/mock".to_string(),
            }))
        })
    }

    async fn poll_operation(&self, _handle: &OperationHandle) -> Result<PollStatus, MediaError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        pop(&self.polls).unwrap_or_else(|| {
            Ok(PollStatus::Done(Some(ArtifactSource::Bytes {
                data: MOCK_VIDEO_BYTES.to_vec(),
                mime_type: "video/mp4".to_string(),
            })))
        })
    }

    async fn fetch(&self, _uri: &str) -> Result<Vec<u8>, MediaError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        pop(&self.fetches).unwrap_or_else(|| Ok(MOCK_VIDEO_BYTES.to_vec()))
    }
}
