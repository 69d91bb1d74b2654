use std::collections::VecDeque;

use ash::vk;

use crate::backend::GfxBackend;
use crate::commands::submit_ring::GfxSubmitRing;
use crate::commands::submit_token::GfxSubmitToken;
use crate::error::GfxResult;

/// 需要延迟执行的 native 释放操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GfxTeardown {
    /// 同时释放 buffer 绑定的内存
    Buffer(vk::Buffer),
    /// 同时释放 image 绑定的内存
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    QueryPool(vk::QueryPool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfxDeferredTask {
    pub action: GfxTeardown,
    pub token: GfxSubmitToken,
    /// 入队时仍在录制的 command buffer，它们可能也引用了这个对象
    pub encoding: Vec<GfxSubmitToken>,
}

impl GfxDeferredTask {
    fn tokens(&self) -> impl Iterator<Item = GfxSubmitToken> + '_ {
        std::iter::once(self.token).chain(self.encoding.iter().copied())
    }

    pub fn is_ready<B: GfxBackend>(&self, ring: &GfxSubmitRing<B>) -> bool {
        self.tokens().all(|token| ring.is_ready(token))
    }
}

/// 延迟销毁队列
///
/// 只从队首弹出任务，保证释放顺序与入队顺序一致：即使后面任务的 token 先完成，也不会越过前面的任务。
#[derive(Default)]
pub struct GfxDeferredQueue {
    tasks: VecDeque<GfxDeferredTask>,
}

impl GfxDeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队一个释放操作
    ///
    /// `token` 为 None 时使用 ring 中最近 acquire 的 token，即"等到即将提交的内容完成之后再释放"，
    /// 同时还要等所有正在录制的 command buffer 提交并完成
    pub fn push<B: GfxBackend>(
        &mut self,
        ring: &GfxSubmitRing<B>,
        action: GfxTeardown,
        token: Option<GfxSubmitToken>,
    ) {
        let task = match token {
            Some(token) => GfxDeferredTask {
                action,
                token,
                encoding: Vec::new(),
            },
            None => {
                let token = ring.next_submit_token();
                GfxDeferredTask {
                    action,
                    token,
                    encoding: ring.encoding_tokens().filter(|encoding| *encoding != token).collect(),
                }
            }
        };
        self.tasks.push_back(task);
    }

    /// 非阻塞：执行队首所有已经完成的任务，返回执行的数量
    pub fn process<B: GfxBackend>(&mut self, ring: &GfxSubmitRing<B>) -> usize {
        let _span = tracy_client::span!("GfxDeferredQueue::process");

        let mut executed = 0;
        while let Some(task) = self.tasks.front() {
            if !task.is_ready(ring) {
                break;
            }
            ring.backend().execute_teardown(task.action);
            self.tasks.pop_front();
            executed += 1;
        }
        if executed > 0 {
            log::debug!("executed {executed} deferred tasks, {} pending", self.tasks.len());
        }
        executed
    }

    /// 阻塞：按顺序等待每个任务的 token，然后执行所有任务
    pub fn wait_all<B: GfxBackend>(&mut self, ring: &mut GfxSubmitRing<B>) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxDeferredQueue::wait_all");

        while let Some(task) = self.tasks.front() {
            let action = task.action;
            let tokens: Vec<_> = task.tokens().collect();
            // 仍在录制的 command buffer 无法等待，ring 会给出警告
            for token in tokens {
                ring.wait(token)?;
            }
            ring.backend().execute_teardown(action);
            self.tasks.pop_front();
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GfxDeferredTask> {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use ash::vk::Handle;

    use super::*;
    use crate::backend::headless::{GfxHeadlessBackend, HeadlessCompletion};

    fn setup(capacity: u32) -> (GfxHeadlessBackend, GfxSubmitRing<GfxHeadlessBackend>) {
        let gpu = GfxHeadlessBackend::new(HeadlessCompletion::Manual);
        let ring = GfxSubmitRing::new(Rc::new(gpu.clone()), capacity, false).unwrap();
        (gpu, ring)
    }

    fn sampler(raw: u64) -> GfxTeardown {
        GfxTeardown::Sampler(vk::Sampler::from_raw(raw))
    }

    #[test]
    fn test_task_waits_for_token() {
        let (gpu, mut ring) = setup(4);
        let r = ring.acquire().unwrap();
        let token = ring.submit(r).unwrap();

        let mut queue = GfxDeferredQueue::new();
        queue.push(&ring, sampler(1), Some(token));

        assert_eq!(queue.process(&ring), 0);
        assert!(gpu.teardowns().is_empty());

        gpu.signal_oldest();
        assert_eq!(queue.process(&ring), 1);
        assert_eq!(gpu.teardowns(), vec![sampler(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_even_if_later_token_finishes_first() {
        let (gpu, mut ring) = setup(4);
        let a = ring.acquire().unwrap();
        let token_a = ring.submit(a).unwrap();
        let b = ring.acquire().unwrap();
        let token_b = ring.submit(b).unwrap();

        let mut queue = GfxDeferredQueue::new();
        queue.push(&ring, sampler(1), Some(token_a));
        queue.push(&ring, sampler(2), Some(token_b));
        queue.push(&ring, sampler(3), Some(GfxSubmitToken::empty()));

        // B 先完成，但 A 还在队首
        gpu.signal_fence(ring.fence_of(token_b).unwrap());
        assert!(ring.is_ready(token_b));
        assert!(!ring.is_ready(token_a));
        assert_eq!(queue.process(&ring), 0);
        assert_eq!(queue.len(), 3);

        gpu.signal_oldest();
        assert_eq!(queue.process(&ring), 3);
        assert_eq!(gpu.teardowns(), vec![sampler(1), sampler(2), sampler(3)]);
    }

    #[test]
    fn test_default_token_is_next_submit() {
        let (gpu, mut ring) = setup(4);
        let mut queue = GfxDeferredQueue::new();

        // 还没有任何 acquire，空 token 立即可以执行
        queue.push(&ring, sampler(1), None);
        assert_eq!(queue.process(&ring), 1);

        let recorder = ring.acquire().unwrap();
        queue.push(&ring, sampler(2), None);
        assert_eq!(queue.iter().next().unwrap().token, recorder.token());

        // 正在录制的 command buffer 还没完成
        assert_eq!(queue.process(&ring), 0);
        ring.submit(recorder).unwrap();
        assert_eq!(queue.process(&ring), 0);

        gpu.signal_oldest();
        assert_eq!(queue.process(&ring), 1);
        assert_eq!(gpu.teardowns(), vec![sampler(1), sampler(2)]);
    }

    #[test]
    fn test_default_token_also_waits_for_encoding_buffers() {
        let (gpu, mut ring) = setup(4);
        let mut queue = GfxDeferredQueue::new();

        // 用户的 command buffer 还在录制，期间另外一次提交已经完成
        let user = ring.acquire().unwrap();
        let internal = ring.acquire().unwrap();
        let internal = ring.submit(internal).unwrap();
        queue.push(&ring, sampler(1), None);
        assert_eq!(queue.iter().next().unwrap().token, internal);
        assert_eq!(queue.iter().next().unwrap().encoding, vec![user.token()]);

        gpu.signal_oldest();
        assert!(ring.is_ready(internal));
        assert_eq!(queue.process(&ring), 0);

        ring.submit(user).unwrap();
        assert_eq!(queue.process(&ring), 0);
        gpu.signal_oldest();
        assert_eq!(queue.process(&ring), 1);
        assert_eq!(gpu.teardowns(), vec![sampler(1)]);
    }

    #[test]
    fn test_wait_all_runs_everything_in_order() {
        let gpu = GfxHeadlessBackend::new(HeadlessCompletion::OnWait);
        let mut ring = GfxSubmitRing::new(Rc::new(gpu.clone()), 4, true).unwrap();
        let mut queue = GfxDeferredQueue::new();

        for i in 0..6u64 {
            let r = ring.acquire().unwrap();
            let token = ring.submit(r).unwrap();
            queue.push(&ring, sampler(i + 1), Some(token));
        }
        // ring 只有 4 个 slot，第 5、6 次 acquire 时已经等待了最早的两次提交
        assert_eq!(queue.process(&ring), 2);

        queue.wait_all(&mut ring).unwrap();
        assert!(queue.is_empty());
        assert_eq!(gpu.teardowns(), (1..=6).map(sampler).collect::<Vec<_>>());
        ring.destroy();
    }
}
