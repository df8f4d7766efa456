//! In-memory [`DisplayContext`] for tests.
//!
//! [`MockContext`] hands out fake handles and simulates the parts of the GPU
//! timeline the frame engine depends on:
//! - fences move `Unsignaled -> Pending -> Signaled` on submit and wait;
//! - binary semaphores move `Unsignaled -> Signaled -> WaitPending` on
//!   acquire/submit, and become reusable once the fence of the submission
//!   that waited on them has been observed;
//! - swapchain images are handed out round-robin and stay acquired until
//!   presented.
//!
//! Every call is recorded, acquire/present/submit results can be scripted,
//! and any misuse a validation layer would flag (submitting with an unreset
//! fence, acquiring with a semaphore that still has a pending wait,
//! destroying in-use objects, double destroys) is collected in
//! [`MockContext::violations`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::context::{DisplayContext, FrameSubmission};
use crate::error::{RhiError, RhiResult};

/// One recorded call into the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSwapchain {
        handle: vk::SwapchainKHR,
        old: vk::SwapchainKHR,
        min_image_count: u32,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
    Acquire {
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        result: VkResult<(u32, bool)>,
    },
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    AllocateCommandBuffers(u32),
    FreeCommandBuffers(u32),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit(FrameSubmission),
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
        result: VkResult<bool>,
    },
    QueueWaitIdle,
    DeviceWaitIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending(u64),
    Signaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SemaphoreState {
    Unsignaled,
    Signaled,
    /// Waited on by the submission fenced by `fence` at `epoch`.
    WaitPending { fence: u64, epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
struct SwapchainSim {
    images: Vec<vk::Image>,
    acquired: HashSet<u32>,
    next_index: u32,
    retired: bool,
}

#[derive(Debug, Clone, Copy)]
enum AcquireScript {
    Fail(vk::Result),
    Suboptimal,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    next_epoch: u64,

    capabilities: vk::SurfaceCapabilitiesKHR,
    drawable: vk::Extent2D,
    format: vk::SurfaceFormatKHR,
    present_modes: Vec<vk::PresentModeKHR>,
    image_count_override: Option<u32>,

    semaphores: HashMap<u64, SemaphoreState>,
    fences: HashMap<u64, FenceState>,
    /// Last epoch each fence was observed complete at.
    completed: HashMap<u64, u64>,
    views: HashSet<u64>,
    swapchains: HashMap<u64, SwapchainSim>,
    pools: HashSet<u64>,
    command_buffers: HashMap<u64, (u64, CommandBufferState)>,
    /// Fence and epoch of the last submission of each command buffer.
    command_buffer_fences: HashMap<u64, (u64, u64)>,

    acquire_script: VecDeque<AcquireScript>,
    present_script: VecDeque<VkResult<bool>>,
    submit_failure: Option<vk::Result>,

    calls: Vec<Call>,
    violations: Vec<String>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    fn fence_done(&self, fence: u64, epoch: u64) -> bool {
        self.completed.get(&fence).is_some_and(|&done| done >= epoch)
    }

    /// A semaphore can be signaled again once nothing waits on it anymore.
    fn semaphore_free(&self, state: SemaphoreState) -> bool {
        match state {
            SemaphoreState::Unsignaled => true,
            SemaphoreState::Signaled => false,
            SemaphoreState::WaitPending { fence, epoch } => self.fence_done(fence, epoch),
        }
    }

    fn complete_fence(&mut self, fence: u64) {
        if let Some(FenceState::Pending(epoch)) = self.fences.get(&fence).copied() {
            self.fences.insert(fence, FenceState::Signaled);
            self.completed.insert(fence, epoch);
        }
    }

    fn complete_all(&mut self) {
        let pending: Vec<u64> = self
            .fences
            .iter()
            .filter(|(_, state)| matches!(state, FenceState::Pending(_)))
            .map(|(&fence, _)| fence)
            .collect();
        for fence in pending {
            self.complete_fence(fence);
        }
    }

    fn swapchain_of_image(&self, image: vk::Image) -> Option<&SwapchainSim> {
        self.swapchains
            .values()
            .find(|sim| sim.images.contains(&image))
    }
}

/// In-memory display context. See the [module documentation](self).
#[derive(Debug)]
pub struct MockContext {
    state: Mutex<State>,
}

impl Default for MockContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContext {
    /// A context with an 800x600 surface supporting 2..=3 images, so the
    /// swapchain picks 3.
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };

        Self {
            state: Mutex::new(State {
                next_handle: 0x1000,
                next_epoch: 0,
                capabilities,
                drawable: capabilities.current_extent,
                format: vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                image_count_override: None,
                semaphores: HashMap::new(),
                fences: HashMap::new(),
                completed: HashMap::new(),
                views: HashSet::new(),
                swapchains: HashMap::new(),
                pools: HashSet::new(),
                command_buffers: HashMap::new(),
                command_buffer_fences: HashMap::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                submit_failure: None,
                calls: Vec::new(),
                violations: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A test that panicked mid-call still leaves usable bookkeeping.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Sets the extent the surface reports (0x0 simulates a minimized window).
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        let mut state = self.lock();
        state.capabilities.current_extent = vk::Extent2D { width, height };
        state.drawable = vk::Extent2D { width, height };
    }

    /// Makes the surface leave the extent up to the swapchain, and sets the
    /// drawable size used instead.
    pub fn set_undefined_extent(&self, drawable_width: u32, drawable_height: u32) {
        let mut state = self.lock();
        state.capabilities.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        state.drawable = vk::Extent2D {
            width: drawable_width,
            height: drawable_height,
        };
    }

    /// Sets the supported image count range (`max == 0` means unbounded).
    pub fn set_image_count_limits(&self, min: u32, max: u32) {
        let mut state = self.lock();
        state.capabilities.min_image_count = min;
        state.capabilities.max_image_count = max;
    }

    /// Makes swapchain creation produce exactly `count` images regardless of
    /// the requested minimum, as drivers are allowed to.
    pub fn set_image_count_override(&self, count: Option<u32>) {
        self.lock().image_count_override = count;
    }

    /// The next acquire fails with `code` without signaling its semaphore.
    pub fn fail_next_acquire(&self, code: vk::Result) {
        self.lock().acquire_script.push_back(AcquireScript::Fail(code));
    }

    /// The next acquire succeeds but reports the swapchain as suboptimal.
    pub fn suboptimal_next_acquire(&self) {
        self.lock().acquire_script.push_back(AcquireScript::Suboptimal);
    }

    /// The next present returns `result`.
    pub fn push_present_result(&self, result: VkResult<bool>) {
        self.lock().present_script.push_back(result);
    }

    /// Every following submit fails with `code`.
    pub fn fail_submits(&self, code: vk::Result) {
        self.lock().submit_failure = Some(code);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Forgets recorded calls; object state is kept.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Protocol violations detected so far.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn submissions(&self) -> Vec<FrameSubmission> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit(submission) => Some(submission),
                _ => None,
            })
            .collect()
    }

    /// Number of presents the mock accepted or rejected.
    pub fn present_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Present { .. }))
            .count()
    }

    /// Swapchains created so far, as `(handle, old_swapchain)`.
    pub fn created_swapchains(&self) -> Vec<(vk::SwapchainKHR, vk::SwapchainKHR)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateSwapchain { handle, old, .. } => Some((handle, old)),
                _ => None,
            })
            .collect()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.lock().semaphores.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.lock().fences.len()
    }

    pub fn live_image_view_count(&self) -> usize {
        self.lock().views.len()
    }

    pub fn live_swapchain_count(&self) -> usize {
        self.lock().swapchains.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.lock().command_buffers.len()
    }

    pub fn live_command_pool_count(&self) -> usize {
        self.lock().pools.len()
    }

    /// True when nothing created through the mock is still alive.
    pub fn all_destroyed(&self) -> bool {
        let state = self.lock();
        state.semaphores.is_empty()
            && state.fences.is_empty()
            && state.views.is_empty()
            && state.swapchains.is_empty()
            && state.pools.is_empty()
            && state.command_buffers.is_empty()
    }
}

impl DisplayContext for MockContext {
    fn device_handle(&self) -> vk::Device {
        vk::Device::from_raw(0xD0)
    }

    fn physical_device(&self) -> vk::PhysicalDevice {
        vk::PhysicalDevice::from_raw(0xD1)
    }

    fn surface(&self) -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(0xD2)
    }

    fn queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0xD3)
    }

    fn queue_family_index(&self) -> u32 {
        0
    }

    fn surface_capabilities(&self) -> RhiResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.lock().capabilities)
    }

    fn surface_format(&self) -> RhiResult<vk::SurfaceFormatKHR> {
        Ok(self.lock().format)
    }

    fn surface_present_modes(&self) -> RhiResult<Vec<vk::PresentModeKHR>> {
        Ok(self.lock().present_modes.clone())
    }

    fn drawable_size(&self) -> vk::Extent2D {
        self.lock().drawable
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.lock();
        let raw = state.handle();
        state.semaphores.insert(raw, SemaphoreState::Unsignaled);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        match state.semaphores.remove(&semaphore.as_raw()) {
            None => state.violation(format!("destroyed unknown semaphore {:?}", semaphore)),
            Some(SemaphoreState::WaitPending { fence, epoch }) if !state.fence_done(fence, epoch) => {
                state.violation(format!(
                    "destroyed semaphore {:?} while a submission still waits on it",
                    semaphore
                ));
            }
            Some(_) => {}
        }
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.lock();
        let raw = state.handle();
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        match state.fences.remove(&fence.as_raw()) {
            None => state.violation(format!("destroyed unknown fence {:?}", fence)),
            Some(FenceState::Pending(_)) => {
                state.violation(format!("destroyed fence {:?} with pending work", fence));
            }
            Some(_) => {}
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> RhiResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::WaitForFence(fence));
        match state.fences.get(&fence.as_raw()).copied() {
            None => {
                state.violation(format!("waited on unknown fence {:?}", fence));
                Err(RhiError::InvalidHandle(format!("{:?}", fence)))
            }
            Some(FenceState::Unsignaled) => {
                state.violation(format!(
                    "waited on fence {:?} that nothing will ever signal",
                    fence
                ));
                Err(RhiError::VulkanError(vk::Result::TIMEOUT))
            }
            Some(FenceState::Pending(_)) => {
                state.complete_fence(fence.as_raw());
                Ok(())
            }
            Some(FenceState::Signaled) => Ok(()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::ResetFence(fence));
        match state.fences.get(&fence.as_raw()).copied() {
            None => {
                state.violation(format!("reset unknown fence {:?}", fence));
                Err(RhiError::InvalidHandle(format!("{:?}", fence)))
            }
            Some(FenceState::Pending(_)) => {
                state.violation(format!("reset fence {:?} with pending work", fence));
                Ok(())
            }
            Some(_) => {
                state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
                Ok(())
            }
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        match self.lock().fences.get(&fence.as_raw()) {
            Some(FenceState::Signaled) => Ok(true),
            Some(_) => Ok(false),
            None => Err(RhiError::InvalidHandle(format!("{:?}", fence))),
        }
    }

    fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> RhiResult<vk::SwapchainKHR> {
        let mut state = self.lock();

        let extent = create_info.image_extent;
        if extent.width == 0 || extent.height == 0 {
            state.violation(format!("created swapchain with zero extent {:?}", extent));
        }

        let old = create_info.old_swapchain;
        if old != vk::SwapchainKHR::null() {
            match state.swapchains.get_mut(&old.as_raw()) {
                Some(sim) if !sim.retired => sim.retired = true,
                Some(_) => state.violation(format!("old swapchain {:?} already retired", old)),
                None => state.violation(format!("old swapchain {:?} is not alive", old)),
            }
        }

        let count = state
            .image_count_override
            .unwrap_or(create_info.min_image_count);
        let images = (0..count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();

        let raw = state.handle();
        let handle = vk::SwapchainKHR::from_raw(raw);
        state.swapchains.insert(
            raw,
            SwapchainSim {
                images,
                acquired: HashSet::new(),
                next_index: 0,
                retired: false,
            },
        );
        state.calls.push(Call::CreateSwapchain {
            handle,
            old,
            min_image_count: create_info.min_image_count,
            extent,
            present_mode: create_info.present_mode,
        });
        Ok(handle)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.lock();
        state.calls.push(Call::DestroySwapchain(swapchain));
        let Some(sim) = state.swapchains.remove(&swapchain.as_raw()) else {
            state.violation(format!("destroyed unknown swapchain {:?}", swapchain));
            return;
        };
        // Views are created from swapchain images and must go first.
        let leaked = sim
            .images
            .iter()
            .filter(|image| state.views.contains(&(image.as_raw() | VIEW_TAG)))
            .count();
        if leaked > 0 {
            state.violation(format!(
                "destroyed swapchain {:?} before {} of its image views",
                swapchain, leaked
            ));
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        let state = self.lock();
        state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sim| sim.images.clone())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", swapchain)))
    }

    fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> RhiResult<vk::ImageView> {
        let mut state = self.lock();
        if state.swapchain_of_image(create_info.image).is_none() {
            state.violation(format!(
                "created view of unknown image {:?}",
                create_info.image
            ));
        }
        if create_info.subresource_range.aspect_mask != vk::ImageAspectFlags::COLOR {
            state.violation("swapchain view without color aspect".to_string());
        }
        // Views are keyed by their image so leaks can be traced back.
        let raw = create_info.image.as_raw() | VIEW_TAG;
        if !state.views.insert(raw) {
            state.violation(format!(
                "second view created for image {:?}",
                create_info.image
            ));
        }
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.lock();
        if !state.views.remove(&view.as_raw()) {
            state.violation(format!("destroyed unknown image view {:?}", view));
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.lock();

        match state.semaphores.get(&semaphore.as_raw()).copied() {
            None => state.violation(format!("acquire with unknown semaphore {:?}", semaphore)),
            Some(sem) if !state.semaphore_free(sem) => state.violation(format!(
                "acquire with semaphore {:?} that is still in use ({:?})",
                semaphore, sem
            )),
            Some(_) => {}
        }

        let script = state.acquire_script.pop_front();
        let result = match script {
            Some(AcquireScript::Fail(code)) => Err(code),
            _ => match state.swapchains.get_mut(&swapchain.as_raw()) {
                None => Err(vk::Result::ERROR_SURFACE_LOST_KHR),
                Some(sim) if sim.retired => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
                Some(sim) => {
                    let count = sim.images.len() as u32;
                    let free = (0..count)
                        .map(|offset| (sim.next_index + offset) % count)
                        .find(|index| !sim.acquired.contains(index));
                    match free {
                        Some(index) => {
                            sim.acquired.insert(index);
                            sim.next_index = (index + 1) % count;
                            Ok((index, matches!(script, Some(AcquireScript::Suboptimal))))
                        }
                        None => Err(vk::Result::NOT_READY),
                    }
                }
            },
        };

        if result.is_ok() {
            state
                .semaphores
                .insert(semaphore.as_raw(), SemaphoreState::Signaled);
        }

        state.calls.push(Call::Acquire {
            swapchain,
            semaphore,
            result,
        });
        result
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let mut state = self.lock();
        let raw = state.handle();
        state.pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        if !state.pools.remove(&pool.as_raw()) {
            state.violation(format!("destroyed unknown command pool {:?}", pool));
        }
        state
            .command_buffers
            .retain(|_, (owner, _)| *owner != pool.as_raw());
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = self.lock();
        if !state.pools.contains(&pool.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", pool)));
        }
        state.calls.push(Call::AllocateCommandBuffers(count));
        let buffers = (0..count)
            .map(|_| {
                let raw = state.handle();
                state
                    .command_buffers
                    .insert(raw, (pool.as_raw(), CommandBufferState::Initial));
                vk::CommandBuffer::from_raw(raw)
            })
            .collect();
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.lock();
        state.calls.push(Call::FreeCommandBuffers(buffers.len() as u32));
        for buffer in buffers {
            if state.command_buffers.remove(&buffer.as_raw()).is_none() {
                state.violation(format!("freed unknown command buffer {:?}", buffer));
            }
            if let Some((fence, epoch)) = state.command_buffer_fences.remove(&buffer.as_raw())
                && !state.fence_done(fence, epoch)
            {
                state.violation(format!("freed command buffer {:?} while in flight", buffer));
            }
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::BeginCommandBuffer(buffer));
        match state.command_buffers.get_mut(&buffer.as_raw()) {
            Some((_, cb)) if *cb != CommandBufferState::Recording => {
                *cb = CommandBufferState::Recording;
                Ok(())
            }
            Some(_) => {
                state.violation(format!("begin on recording command buffer {:?}", buffer));
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("{:?}", buffer))),
        }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::EndCommandBuffer(buffer));
        match state.command_buffers.get_mut(&buffer.as_raw()) {
            Some((_, cb)) if *cb == CommandBufferState::Recording => {
                *cb = CommandBufferState::Executable;
                Ok(())
            }
            Some(_) => {
                state.violation(format!("end on command buffer {:?} not recording", buffer));
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("{:?}", buffer))),
        }
    }

    fn queue_submit(&self, submission: &FrameSubmission) -> VkResult<()> {
        let mut state = self.lock();
        if let Some(code) = state.submit_failure {
            return Err(code);
        }
        state.calls.push(Call::Submit(*submission));

        let cb = submission.command_buffer.as_raw();
        match state.command_buffers.get(&cb) {
            Some((_, CommandBufferState::Executable)) => {}
            other => {
                let other = other.copied();
                state.violation(format!(
                    "submitted command buffer {:?} in state {:?}",
                    submission.command_buffer, other
                ));
            }
        }

        let fence = submission.fence.as_raw();
        match state.fences.get(&fence).copied() {
            Some(FenceState::Unsignaled) => {}
            other => state.violation(format!(
                "submitted with fence {:?} in state {:?}",
                submission.fence, other
            )),
        }
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        state.fences.insert(fence, FenceState::Pending(epoch));
        state.command_buffer_fences.insert(cb, (fence, epoch));

        let wait = submission.wait_semaphore.as_raw();
        if state.semaphores.get(&wait).copied() != Some(SemaphoreState::Signaled) {
            state.violation(format!(
                "submit waits on semaphore {:?} that was never signaled",
                submission.wait_semaphore
            ));
        }
        state
            .semaphores
            .insert(wait, SemaphoreState::WaitPending { fence, epoch });

        let signal = submission.signal_semaphore.as_raw();
        match state.semaphores.get(&signal).copied() {
            Some(sem) if state.semaphore_free(sem) => {}
            other => state.violation(format!(
                "submit signals semaphore {:?} in state {:?}",
                submission.signal_semaphore, other
            )),
        }
        state.semaphores.insert(signal, SemaphoreState::Signaled);

        Ok(())
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.lock();

        if state.semaphores.get(&wait_semaphore.as_raw()).copied()
            != Some(SemaphoreState::Signaled)
        {
            state.violation(format!(
                "present waits on semaphore {:?} that was never signaled",
                wait_semaphore
            ));
        }
        // The wait executes even when presentation is rejected.
        state
            .semaphores
            .insert(wait_semaphore.as_raw(), SemaphoreState::Unsignaled);

        match state.swapchains.get_mut(&swapchain.as_raw()) {
            Some(sim) => {
                if !sim.acquired.remove(&image_index) {
                    state.violation(format!(
                        "presented image {} that was not acquired",
                        image_index
                    ));
                }
            }
            None => state.violation(format!("present on unknown swapchain {:?}", swapchain)),
        }

        let result = state.present_script.pop_front().unwrap_or(Ok(false));
        state.calls.push(Call::Present {
            swapchain,
            image_index,
            wait_semaphore,
            result,
        });
        result
    }

    fn queue_wait_idle(&self) -> RhiResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::QueueWaitIdle);
        state.complete_all();
        Ok(())
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DeviceWaitIdle);
        state.complete_all();
        Ok(())
    }
}

/// High bit that distinguishes fake view handles from fake image handles.
const VIEW_TAG: u64 = 1 << 62;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaled_semaphore_cannot_be_acquired_with() {
        let mock = MockContext::new();
        let info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(2)
            .image_extent(vk::Extent2D {
                width: 800,
                height: 600,
            });
        let swapchain = mock.create_swapchain(&info).unwrap();
        let semaphore = mock.create_semaphore().unwrap();

        mock.acquire_next_image(swapchain, u64::MAX, semaphore)
            .unwrap();
        assert!(mock.violations().is_empty());

        mock.acquire_next_image(swapchain, u64::MAX, semaphore)
            .unwrap();
        assert_eq!(mock.violations().len(), 1);
    }

    #[test]
    fn test_images_stay_acquired_until_presented() {
        let mock = MockContext::new();
        let info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(2)
            .image_extent(vk::Extent2D {
                width: 800,
                height: 600,
            });
        let swapchain = mock.create_swapchain(&info).unwrap();
        let a = mock.create_semaphore().unwrap();
        let b = mock.create_semaphore().unwrap();
        let c = mock.create_semaphore().unwrap();

        assert_eq!(mock.acquire_next_image(swapchain, 0, a), Ok((0, false)));
        assert_eq!(mock.acquire_next_image(swapchain, 0, b), Ok((1, false)));
        assert_eq!(
            mock.acquire_next_image(swapchain, 0, c),
            Err(vk::Result::NOT_READY)
        );
    }

    #[test]
    fn test_retired_swapchain_reports_out_of_date() {
        let mock = MockContext::new();
        let info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(2)
            .image_extent(vk::Extent2D {
                width: 800,
                height: 600,
            });
        let old = mock.create_swapchain(&info).unwrap();
        let _new = mock
            .create_swapchain(&info.old_swapchain(old))
            .unwrap();
        let semaphore = mock.create_semaphore().unwrap();

        assert_eq!(
            mock.acquire_next_image(old, 0, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
    }
}
