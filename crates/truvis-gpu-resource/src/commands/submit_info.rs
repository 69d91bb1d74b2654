use ash::vk;
use itertools::Itertools;

/// 一个等待或者发出的 semaphore；binary semaphore 的 value 为 0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxSemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
    pub value: u64,
}

impl GfxSemaphoreSubmit {
    #[inline]
    pub fn vk_info(&self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default().semaphore(self.semaphore).stage_mask(self.stage).value(self.value)
    }
}

/// 一次 queue submit 的描述：一个 command buffer 以及等待/发出的 semaphore
#[derive(Clone, Debug, Default)]
pub struct GfxSubmitInfo {
    command_buffer: vk::CommandBuffer,
    wait_infos: Vec<GfxSemaphoreSubmit>,
    signal_infos: Vec<GfxSemaphoreSubmit>,
}

impl GfxSubmitInfo {
    pub fn new(command_buffer: vk::CommandBuffer) -> Self {
        Self {
            command_buffer,
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    /// builder
    #[inline]
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.wait_infos.push(GfxSemaphoreSubmit {
            semaphore,
            stage,
            value: value.unwrap_or_default(),
        });
        self
    }

    /// builder
    #[inline]
    pub fn signal(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.signal_infos.push(GfxSemaphoreSubmit {
            semaphore,
            stage,
            value: value.unwrap_or_default(),
        });
        self
    }
}

// getters
impl GfxSubmitInfo {
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    #[inline]
    pub fn wait_infos(&self) -> &[GfxSemaphoreSubmit] {
        &self.wait_infos
    }

    #[inline]
    pub fn signal_infos(&self) -> &[GfxSemaphoreSubmit] {
        &self.signal_infos
    }

    pub fn vk_wait_infos(&self) -> Vec<vk::SemaphoreSubmitInfo<'static>> {
        self.wait_infos.iter().map(GfxSemaphoreSubmit::vk_info).collect_vec()
    }

    pub fn vk_signal_infos(&self) -> Vec<vk::SemaphoreSubmitInfo<'static>> {
        self.signal_infos.iter().map(GfxSemaphoreSubmit::vk_info).collect_vec()
    }
}
