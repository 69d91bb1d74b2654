use std::rc::Rc;

use ash::vk;

use crate::backend::GfxBackend;
use crate::commands::submit_info::GfxSubmitInfo;
use crate::commands::submit_token::GfxSubmitToken;
use crate::error::{GfxError, GfxResult};

/// 从 ring 中取出的、正在录制的 command buffer
///
/// 不能 Clone，只能通过 [`GfxSubmitRing::submit`] 消耗掉，保证每个 slot 只会被提交一次
#[derive(Debug)]
pub struct GfxCommandRecorder {
    slot_index: u32,
    command_buffer: vk::CommandBuffer,
    token: GfxSubmitToken,
}

impl GfxCommandRecorder {
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// 提交之后会得到的 token
    #[inline]
    pub fn token(&self) -> GfxSubmitToken {
        self.token
    }
}

struct GfxRingSlot {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    token: GfxSubmitToken,
    /// 已经被 acquire，且还没有被 purge 回收
    in_use: bool,
    is_encoding: bool,
    /// 提交时所在的 semaphore 链
    chain_epoch: u32,
}

/// 固定数量的 command buffer 环
///
/// 每个 slot 有自己的 fence 和 semaphore。slot 只有在 fence signaled 并被 [`Self::purge`] 回收之后才能再次使用，
/// 因此同一个 slot 上的提交严格有序。
pub struct GfxSubmitRing<B: GfxBackend> {
    backend: Rc<B>,
    command_pool: vk::CommandPool,
    slots: Vec<GfxRingSlot>,

    available: u32,
    /// 下一次 acquire 使用的 submit id，永远不为 0
    submit_counter: u32,

    last_submit: GfxSubmitToken,
    /// 最近一次 acquire 的 slot 对应的 token
    next_submit: GfxSubmitToken,

    chain_submissions: bool,
    /// 每当一次提交不再等待上一次提交时加一
    chain_epoch: u32,
    last_submit_semaphore: Option<vk::Semaphore>,
    pending_wait: Option<vk::Semaphore>,
    pending_signal: Option<(vk::Semaphore, u64)>,

    destroyed: bool,
}

// new & init
impl<B: GfxBackend> GfxSubmitRing<B> {
    pub fn new(backend: Rc<B>, capacity: u32, chain_submissions: bool) -> GfxResult<Self> {
        let _span = tracy_client::span!("GfxSubmitRing::new");
        debug_assert!(capacity.is_power_of_two());

        let command_pool = backend.create_command_pool("submit-ring")?;
        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            slots.push(GfxRingSlot {
                command_buffer: backend.allocate_command_buffer(command_pool, &format!("submit-ring-cmd-{i}"))?,
                fence: backend.create_fence(false, &format!("submit-ring-fence-{i}"))?,
                semaphore: backend.create_semaphore(&format!("submit-ring-semaphore-{i}"))?,
                token: GfxSubmitToken {
                    slot_index: i,
                    submit_id: 0,
                },
                in_use: false,
                is_encoding: false,
                chain_epoch: 0,
            });
        }

        Ok(Self {
            backend,
            command_pool,
            slots,
            available: capacity,
            submit_counter: 1,
            last_submit: GfxSubmitToken::empty(),
            next_submit: GfxSubmitToken::empty(),
            chain_submissions,
            chain_epoch: 0,
            last_submit_semaphore: None,
            pending_wait: None,
            pending_signal: None,
            destroyed: false,
        })
    }
}

// destroy
impl<B: GfxBackend> GfxSubmitRing<B> {
    /// 等待所有提交完成，然后释放 ring 持有的 native 对象
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(e) = self.wait_all() {
            log::error!("failed to wait for the submit ring while destroying: {e}");
        }

        for slot in self.slots.drain(..) {
            self.backend.destroy_fence(slot.fence);
            self.backend.destroy_semaphore(slot.semaphore);
        }
        // command buffer 随 pool 一起释放
        self.backend.destroy_command_pool(self.command_pool);
        self.available = 0;
        self.destroyed = true;
    }
}

// acquire & submit
impl<B: GfxBackend> GfxSubmitRing<B> {
    /// 取出一个空闲的 slot 并开始录制
    ///
    /// 没有空闲 slot 时先 purge；仍然没有则阻塞在最早的提交上，直到它完成。
    pub fn acquire(&mut self) -> GfxResult<GfxCommandRecorder> {
        let _span = tracy_client::span!("GfxSubmitRing::acquire");

        if self.available == 0 {
            self.purge()?;
        }
        while self.available == 0 {
            let Some(oldest) = self.oldest_in_flight() else {
                // 所有 slot 都在录制中，没有任何提交可以等待
                return Err(GfxError::RingExhausted {
                    capacity: self.capacity(),
                });
            };
            log::warn!(
                "submit ring is full ({} command buffers in flight), blocking on {:?}",
                self.capacity(),
                self.slots[oldest].token
            );
            self.backend.wait_fences(&[self.slots[oldest].fence], u64::MAX)?;
            self.purge()?;
        }

        let submit_id = self.submit_counter;
        let Some(slot) = self.slots.iter_mut().find(|slot| !slot.in_use) else {
            return Err(GfxError::Backend("submit ring lost track of its free slots".to_string()));
        };

        self.backend.begin_command_buffer(slot.command_buffer)?;
        slot.in_use = true;
        slot.is_encoding = true;
        slot.token.submit_id = submit_id;
        self.available -= 1;
        self.next_submit = slot.token;

        self.submit_counter = self.submit_counter.wrapping_add(1);
        if self.submit_counter == 0 {
            self.submit_counter = 1;
        }

        Ok(GfxCommandRecorder {
            slot_index: slot.token.slot_index,
            command_buffer: slot.command_buffer,
            token: slot.token,
        })
    }

    /// 结束录制并提交，返回这次提交的 token
    pub fn submit(&mut self, recorder: GfxCommandRecorder) -> GfxResult<GfxSubmitToken> {
        let _span = tracy_client::span!("GfxSubmitRing::submit");

        let slot = &mut self.slots[recorder.slot_index as usize];
        debug_assert!(slot.is_encoding, "submitting a command buffer which is not being encoded");
        debug_assert_eq!(slot.token, recorder.token);

        self.backend.end_command_buffer(slot.command_buffer)?;

        let chained = self.chain_submissions && self.last_submit_semaphore.is_some();
        let mut submit_info = GfxSubmitInfo::new(slot.command_buffer);
        if let Some(semaphore) = self.pending_wait.take() {
            submit_info = submit_info.wait(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, None);
        }
        if self.chain_submissions {
            if let Some(semaphore) = self.last_submit_semaphore {
                submit_info = submit_info.wait(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, None);
            }
            submit_info = submit_info.signal(slot.semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, None);
        }
        if let Some((semaphore, value)) = self.pending_signal.take() {
            submit_info = submit_info.signal(semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, Some(value));
        }

        self.backend.queue_submit(&submit_info, slot.fence)?;

        if !chained {
            self.chain_epoch = self.chain_epoch.wrapping_add(1);
        }
        if self.chain_submissions {
            self.last_submit_semaphore = Some(slot.semaphore);
        }
        slot.chain_epoch = self.chain_epoch;
        self.last_submit = slot.token;
        slot.is_encoding = false;

        Ok(self.last_submit)
    }

    /// 下一次提交需要额外等待的 semaphore
    pub fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        debug_assert!(self.pending_wait.is_none(), "only one pending wait semaphore is supported");
        self.pending_wait = Some(semaphore);
    }

    /// 下一次提交需要额外发出的 timeline semaphore
    pub fn signal_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        debug_assert!(self.pending_signal.is_none(), "only one pending signal semaphore is supported");
        self.pending_signal = Some((semaphore, value));
    }

    /// 取走最近一次提交发出的 semaphore（例如交给 present 等待），之后的提交不再等待它
    pub fn take_last_submit_semaphore(&mut self) -> Option<vk::Semaphore> {
        self.last_submit_semaphore.take()
    }
}

// wait & purge
impl<B: GfxBackend> GfxSubmitRing<B> {
    pub fn is_ready(&self, token: GfxSubmitToken) -> bool {
        if token.is_empty() {
            return true;
        }
        let Some(slot) = self.slots.get(token.slot_index as usize) else {
            return true;
        };
        if !slot.in_use {
            return true;
        }
        if slot.token.submit_id != token.submit_id {
            return true;
        }
        self.backend.poll_fence(slot.fence)
    }

    /// 阻塞直到 token 完成；空 token 表示等待整个 device idle
    pub fn wait(&mut self, token: GfxSubmitToken) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxSubmitRing::wait");

        if token.is_empty() {
            self.backend.device_wait_idle()?;
            self.purge()?;
            return Ok(());
        }
        if self.is_ready(token) {
            return Ok(());
        }

        let slot = &self.slots[token.slot_index as usize];
        if slot.is_encoding {
            // 还没有提交，等待没有意义
            log::warn!("waiting on {token:?} which is still being encoded");
            return Ok(());
        }

        if !self.backend.wait_fences(&[slot.fence], u64::MAX)? {
            return Err(GfxError::Backend(format!("timeout while waiting on {token:?}")));
        }
        self.purge()?;
        Ok(())
    }

    /// 等待所有已经提交的 command buffer
    pub fn wait_all(&mut self) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxSubmitRing::wait_all");

        let fences: Vec<vk::Fence> = self
            .slots
            .iter()
            .filter(|slot| slot.in_use && !slot.is_encoding)
            .map(|slot| slot.fence)
            .collect();
        if !fences.is_empty() && !self.backend.wait_fences(&fences, u64::MAX)? {
            return Err(GfxError::Backend("timeout while waiting on all submissions".to_string()));
        }
        self.purge()?;
        Ok(())
    }

    /// 回收所有 fence 已经 signaled 的 slot，返回回收的数量
    ///
    /// 从最近一次提交的下一个 slot 开始扫描
    pub fn purge(&mut self) -> GfxResult<u32> {
        let n = self.slots.len();
        let start = self.last_submit.slot_index as usize + 1;
        let mut freed = 0;

        for i in 0..n {
            let slot = &mut self.slots[(start + i) % n];
            if !slot.in_use || slot.is_encoding {
                continue;
            }
            if self.backend.poll_fence(slot.fence) {
                self.backend.reset_command_buffer(slot.command_buffer)?;
                self.backend.reset_fence(slot.fence)?;
                slot.in_use = false;
                slot.token.submit_id = 0;
                self.available += 1;
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// 已经提交但还没有被回收的 slot 中，最早提交的那一个
    fn oldest_in_flight(&self) -> Option<usize> {
        let counter = self.submit_counter;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.in_use && !slot.is_encoding)
            .max_by_key(|(_, slot)| counter.wrapping_sub(slot.token.submit_id))
            .map(|(index, _)| index)
    }
}

// getters
impl<B: GfxBackend> GfxSubmitRing<B> {
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn available(&self) -> u32 {
        self.available
    }

    #[inline]
    pub fn last_submit_token(&self) -> GfxSubmitToken {
        self.last_submit
    }

    #[inline]
    pub fn next_submit_token(&self) -> GfxSubmitToken {
        self.next_submit
    }

    #[inline]
    pub fn chain_submissions(&self) -> bool {
        self.chain_submissions
    }

    /// token 对应的 fence；slot 已经被回收或者复用时返回 None
    pub fn fence_of(&self, token: GfxSubmitToken) -> Option<vk::Fence> {
        self.slots
            .get(token.slot_index as usize)
            .filter(|slot| slot.in_use && slot.token.submit_id == token.submit_id)
            .map(|slot| slot.fence)
    }

    /// 最近一次提交完成时，`token` 是否一定也已经完成
    ///
    /// 只有通过 semaphore 链串在最近一次提交之前的提交才满足；链被 [`Self::take_last_submit_semaphore`]
    /// 取走或者没有开启 chain submissions 时，之前的提交不再有这个保证
    pub fn is_in_current_chain(&self, token: GfxSubmitToken) -> bool {
        self.slots
            .get(token.slot_index as usize)
            .filter(|slot| slot.in_use && !slot.is_encoding && slot.token.submit_id == token.submit_id)
            .is_some_and(|slot| slot.chain_epoch == self.chain_epoch)
    }

    /// 正在录制的 command buffer 提交之后会得到的 token
    pub fn encoding_tokens(&self) -> impl Iterator<Item = GfxSubmitToken> + '_ {
        self.slots.iter().filter(|slot| slot.is_encoding).map(|slot| slot.token)
    }

    /// 已经提交、还没有被回收的 command buffer 数量
    pub fn in_flight(&self) -> u32 {
        self.slots.iter().filter(|slot| slot.in_use && !slot.is_encoding).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::backend::headless::{GfxHeadlessBackend, HeadlessCompletion};

    fn ring(completion: HeadlessCompletion, capacity: u32) -> (GfxHeadlessBackend, GfxSubmitRing<GfxHeadlessBackend>) {
        let gpu = GfxHeadlessBackend::new(completion);
        let ring = GfxSubmitRing::new(Rc::new(gpu.clone()), capacity, true).unwrap();
        (gpu, ring)
    }

    #[test]
    fn test_tokens_are_monotonic_and_nonzero() {
        let (_gpu, mut ring) = ring(HeadlessCompletion::Immediate, 4);
        let mut last = 0;
        for _ in 0..10 {
            let recorder = ring.acquire().unwrap();
            let token = ring.submit(recorder).unwrap();
            assert!(!token.is_empty());
            assert!(token.submit_id() > last);
            last = token.submit_id();
            assert!(ring.is_ready(token));
        }
    }

    #[test]
    fn test_counter_skips_zero() {
        let (_gpu, mut ring) = ring(HeadlessCompletion::Immediate, 4);
        ring.submit_counter = u32::MAX;
        let a = ring.acquire().unwrap();
        assert_eq!(ring.submit(a).unwrap().submit_id(), u32::MAX);
        let b = ring.acquire().unwrap();
        assert_eq!(ring.submit(b).unwrap().submit_id(), 1);
    }

    #[test]
    fn test_ready_after_fence_signaled() {
        let (gpu, mut ring) = ring(HeadlessCompletion::Manual, 4);
        let recorder = ring.acquire().unwrap();
        let token = recorder.token();
        assert_eq!(ring.next_submit_token(), token);
        assert!(!ring.is_ready(token));

        let submitted = ring.submit(recorder).unwrap();
        assert_eq!(submitted, token);
        assert_eq!(ring.last_submit_token(), token);
        assert!(!ring.is_ready(token));
        assert_eq!(ring.available(), 3);

        assert!(gpu.signal_oldest());
        assert!(ring.is_ready(token));
        assert_eq!(ring.purge().unwrap(), 1);
        assert_eq!(ring.available(), 4);
        assert!(ring.is_ready(token));
    }

    #[test]
    fn test_stale_token_is_ready_after_slot_reuse() {
        let (gpu, mut ring) = ring(HeadlessCompletion::Manual, 1);
        let first = ring.acquire().unwrap();
        let first = ring.submit(first).unwrap();
        gpu.signal_oldest();

        let second = ring.acquire().unwrap();
        assert_eq!(second.token().slot_index(), first.slot_index());
        let second = ring.submit(second).unwrap();

        assert!(ring.is_ready(first));
        assert!(!ring.is_ready(second));
        gpu.complete_all();
        ring.wait_all().unwrap();
    }

    #[test]
    fn test_submissions_are_chained() {
        let (gpu, mut ring) = ring(HeadlessCompletion::Immediate, 4);
        let a = ring.acquire().unwrap();
        ring.submit(a).unwrap();
        let b = ring.acquire().unwrap();
        ring.submit(b).unwrap();

        let log = gpu.submission_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].waits.is_empty());
        assert_eq!(log[0].signals.len(), 1);
        assert_eq!(log[1].waits, vec![log[0].signals[0].0]);

        // present 取走 semaphore 之后，下一次提交不再等待它
        let taken = ring.take_last_submit_semaphore();
        assert_eq!(taken, Some(log[1].signals[0].0));
        let c = ring.acquire().unwrap();
        ring.submit(c).unwrap();
        assert!(gpu.submission_log()[2].waits.is_empty());
    }

    #[test]
    fn test_taking_the_semaphore_starts_a_new_chain() {
        let (_gpu, mut ring) = ring(HeadlessCompletion::Manual, 4);
        let a = ring.acquire().unwrap();
        let a = ring.submit(a).unwrap();
        let b = ring.acquire().unwrap();
        let b = ring.submit(b).unwrap();
        assert!(ring.is_in_current_chain(a));
        assert!(ring.is_in_current_chain(b));

        // 取走之后 b 仍然是链尾，直到下一次提交
        ring.take_last_submit_semaphore();
        assert!(ring.is_in_current_chain(a));

        let c = ring.acquire().unwrap();
        assert!(!ring.is_in_current_chain(c.token()));
        let c = ring.submit(c).unwrap();
        assert!(!ring.is_in_current_chain(a));
        assert!(!ring.is_in_current_chain(b));
        assert!(ring.is_in_current_chain(c));
    }

    #[test]
    fn test_unchained_ring_has_no_chain() {
        let gpu = GfxHeadlessBackend::new(HeadlessCompletion::Manual);
        let mut ring = GfxSubmitRing::new(Rc::new(gpu.clone()), 4, false).unwrap();
        let a = ring.acquire().unwrap();
        let a = ring.submit(a).unwrap();
        let b = ring.acquire().unwrap();
        let b = ring.submit(b).unwrap();
        assert!(!ring.is_in_current_chain(a));
        assert!(ring.is_in_current_chain(b));
    }

    #[test]
    fn test_encoding_tokens() {
        let (_gpu, mut ring) = ring(HeadlessCompletion::Manual, 4);
        let a = ring.acquire().unwrap();
        let b = ring.acquire().unwrap();
        assert_ne!(a.token(), b.token());
        assert_ne!(a.token().submit_id(), b.token().submit_id());

        let tokens: Vec<_> = ring.encoding_tokens().collect();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains(&a.token()) && tokens.contains(&b.token()));

        ring.submit(a).unwrap();
        assert_eq!(ring.encoding_tokens().collect::<Vec<_>>(), vec![b.token()]);
        ring.submit(b).unwrap();
        assert_eq!(ring.encoding_tokens().count(), 0);
    }

    #[test]
    fn test_pending_wait_and_signal() {
        let (gpu, mut ring) = ring(HeadlessCompletion::Immediate, 4);
        let external = gpu.create_semaphore("external").unwrap();
        let timeline = gpu.create_semaphore("timeline").unwrap();

        ring.wait_semaphore(external);
        ring.signal_semaphore(timeline, 42);
        let a = ring.acquire().unwrap();
        ring.submit(a).unwrap();

        let record = &gpu.submission_log()[0];
        assert_eq!(record.waits, vec![external]);
        assert!(record.signals.contains(&(timeline, 42)));

        // 只作用于一次提交
        let b = ring.acquire().unwrap();
        ring.submit(b).unwrap();
        let record = &gpu.submission_log()[1];
        assert!(!record.waits.contains(&external));
        assert!(!record.signals.contains(&(timeline, 42)));
    }

    #[test]
    fn test_wait_on_token() {
        let (gpu, mut ring) = ring(HeadlessCompletion::OnWait, 4);
        let a = ring.acquire().unwrap();
        let token = ring.submit(a).unwrap();
        assert!(!ring.is_ready(token));
        ring.wait(token).unwrap();
        assert!(ring.is_ready(token));
        assert_eq!(ring.available(), 4);
        assert_eq!(gpu.pending_submissions(), 0);
    }

    #[test]
    fn test_wait_on_encoding_slot_returns() {
        let (_gpu, mut ring) = ring(HeadlessCompletion::Manual, 4);
        let recorder = ring.acquire().unwrap();
        ring.wait(recorder.token()).unwrap();
        assert!(!ring.is_ready(recorder.token()));
        ring.submit(recorder).unwrap();
    }

    #[test]
    fn test_wait_empty_token_idles_device() {
        let (gpu, mut ring) = ring(HeadlessCompletion::OnWait, 4);
        for _ in 0..3 {
            let r = ring.acquire().unwrap();
            ring.submit(r).unwrap();
        }
        assert_eq!(gpu.pending_submissions(), 3);
        ring.wait(GfxSubmitToken::empty()).unwrap();
        assert_eq!(gpu.pending_submissions(), 0);
        assert_eq!(ring.available(), 4);
    }

    #[test]
    fn test_exhausted_ring_blocks_until_signaled() {
        let (gpu, mut ring) = ring(HeadlessCompletion::Manual, 4);
        let mut tokens = Vec::new();
        for _ in 0..4 {
            let r = ring.acquire().unwrap();
            tokens.push(ring.submit(r).unwrap());
        }
        assert_eq!(ring.available(), 0);

        let signaled = Arc::new(AtomicBool::new(false));
        let signaler = {
            let gpu = gpu.clone();
            let signaled = signaled.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                signaled.store(true, Ordering::SeqCst);
                gpu.signal_oldest();
            })
        };

        let recorder = ring.acquire().unwrap();
        assert!(signaled.load(Ordering::SeqCst));
        // 只能复用已经完成的那一个 slot
        assert_eq!(recorder.token().slot_index(), tokens[0].slot_index());
        assert!(ring.is_ready(tokens[0]));
        assert!(tokens[1..].iter().all(|t| !ring.is_ready(*t)));

        signaler.join().unwrap();
        ring.submit(recorder).unwrap();
        gpu.complete_all();
        ring.destroy();
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_all_slots_encoding_is_reported() {
        let (_gpu, mut ring) = ring(HeadlessCompletion::Manual, 2);
        let _a = ring.acquire().unwrap();
        let _b = ring.acquire().unwrap();
        assert!(matches!(ring.acquire(), Err(GfxError::RingExhausted { capacity: 2 })));
    }

    #[test]
    fn test_destroy_releases_native_objects() {
        let (gpu, mut ring) = ring(HeadlessCompletion::OnWait, 4);
        let r = ring.acquire().unwrap();
        ring.submit(r).unwrap();
        ring.destroy();
        assert_eq!(gpu.live_sync_objects(), 0);
        assert!(gpu.violations().is_empty());
    }
}
