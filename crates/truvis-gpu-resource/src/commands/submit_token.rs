use std::fmt::{Debug, Formatter};

/// 一次 command buffer 提交的标识
///
/// `slot_index` 是提交所使用的 ring slot，`submit_id` 是单调递增的提交计数（跳过 0）。
/// `submit_id` 为 0 表示空 token，空 token 永远是 ready 的。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GfxSubmitToken {
    pub(crate) slot_index: u32,
    pub(crate) submit_id: u32,
}

impl GfxSubmitToken {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            slot_index: 0,
            submit_id: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.submit_id == 0
    }

    #[inline]
    pub fn slot_index(&self) -> u32 {
        self.slot_index
    }

    #[inline]
    pub fn submit_id(&self) -> u32 {
        self.submit_id
    }
}

impl Debug for GfxSubmitToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "SubmitToken(empty)")
        } else {
            write!(f, "SubmitToken(slot {}, #{})", self.slot_index, self.submit_id)
        }
    }
}
