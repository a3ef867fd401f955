// Buffer utilities for vertex, index, and constant buffers
//
// A buffer is either created with data, uploaded once through a staging
// buffer into device-local memory, or created empty in host-visible memory
// and kept persistently mapped for per-frame updates.

use anyhow::{bail, Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::deletion::RhiResource;
use super::rhi::{BufferDesc, DeviceRef, GpuBuffer, MemoryLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
    Constant,
}

impl BufferKind {
    fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferKind::Constant => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }
}

pub struct Buffer {
    kind: BufferKind,
    name: String,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    stride: u32,
    element_count: u32,
    is_mappable: bool,
    mapped: Option<NonNull<u8>>,
    device: DeviceRef,
}

impl Buffer {
    /// An empty buffer, nothing is allocated until `create`
    pub fn new(device: DeviceRef, kind: BufferKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_owned(),
            buffer: vk::Buffer::null(),
            size: 0,
            stride: 0,
            element_count: 0,
            is_mappable: false,
            mapped: None,
            device,
        }
    }

    /// (Re)create the storage.
    ///
    /// With `data` the contents are uploaded once into device-local memory and
    /// the buffer is not mappable. Without it the buffer lives in host-visible
    /// memory with a mapping that stays valid until the buffer is destroyed.
    /// Any previous storage is retired first.
    pub fn create(&mut self, size: vk::DeviceSize, data: Option<&[u8]>) -> Result<()> {
        assert!(size > 0, "Buffer size must be greater than zero");
        if let Some(data) = data {
            assert_eq!(data.len() as vk::DeviceSize, size, "Data doesn't match the buffer size");
        }

        self.destroy();

        let usage = self.kind.usage();
        let gpu_buffer = match data {
            None => self
                .device
                .create_buffer(&BufferDesc {
                    size,
                    usage,
                    location: MemoryLocation::CpuToGpu,
                    data: None,
                    name: &self.name,
                })
                .with_context(|| format!("Failed to create buffer {}", self.name))?,
            Some(data) => self.upload(size, usage, data)?,
        };

        self.buffer = gpu_buffer.handle;
        self.size = size;
        self.is_mappable = data.is_none();
        self.mapped = gpu_buffer.mapped;

        if self.is_mappable && self.mapped.is_none() {
            bail!("Buffer {} is host-visible but was not mapped", self.name);
        }

        log::debug!(
            "Created {:?} buffer {} ({} bytes, {})",
            self.kind,
            self.name,
            size,
            if self.is_mappable { "mapped" } else { "staged" }
        );

        Ok(())
    }

    /// Copy `data` into a new device-local buffer through a staging buffer
    fn upload(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags, data: &[u8]) -> Result<GpuBuffer> {
        let staging = self
            .device
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                data: Some(data),
                name: &format!("{}_staging", self.name),
            })
            .with_context(|| format!("Failed to create staging buffer for {}", self.name))?;

        let upload = || -> Result<GpuBuffer> {
            let destination = self
                .device
                .create_buffer(&BufferDesc {
                    size,
                    usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
                    location: MemoryLocation::GpuOnly,
                    data: None,
                    name: &self.name,
                })
                .with_context(|| format!("Failed to create buffer {}", self.name))?;

            let copied = self.device.immediate_begin().and_then(|cmd| {
                self.device.cmd_copy_buffer(cmd, staging.handle, destination.handle, size);
                self.device.immediate_submit(cmd)
            });
            if let Err(e) = copied {
                self.device.destroy_buffer(destination.handle);
                return Err(e.context(format!("Failed to upload buffer {}", self.name)));
            }

            Ok(destination)
        };
        let result = upload();

        // The copy has completed (or never ran), staging can go right away
        self.device.destroy_buffer(staging.handle);

        result
    }

    fn destroy(&mut self) {
        if self.buffer != vk::Buffer::null() {
            self.device.retire(RhiResource::Buffer(self.buffer));
            self.buffer = vk::Buffer::null();
        }
        self.mapped = None;
        self.size = 0;
        self.stride = 0;
        self.element_count = 0;
    }

    /// Create from typed elements, uploaded through staging
    pub fn create_from<T: Pod>(&mut self, elements: &[T]) -> Result<()> {
        assert!(!elements.is_empty(), "No elements to create {} from", self.name);

        let bytes: &[u8] = bytemuck::cast_slice(elements);
        self.create(bytes.len() as vk::DeviceSize, Some(bytes))?;
        self.stride = std::mem::size_of::<T>() as u32;
        self.element_count = elements.len() as u32;

        Ok(())
    }

    /// Create mappable storage for `count` elements of `T`
    pub fn create_for<T: Pod>(&mut self, count: u32) -> Result<()> {
        assert!(count > 0, "No elements to create {} for", self.name);

        let stride = std::mem::size_of::<T>() as u32;
        self.create(stride as vk::DeviceSize * count as vk::DeviceSize, None)?;
        self.stride = stride;
        self.element_count = count;

        Ok(())
    }

    /// Persistent mapping, None for staged buffers
    pub fn map(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Mappable buffers stay mapped, nothing to do
    pub fn unmap(&self) {}

    /// Byte view of the mapping
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        // SAFETY: the mapping covers `size` bytes and lives as long as the
        // allocation, which is only released after `destroy` clears `mapped`.
        // `&mut self` makes the view exclusive.
        self.mapped
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }

    /// Write typed elements to the start of a mappable buffer
    pub fn write<T: Pod>(&mut self, elements: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(elements);
        assert!(self.is_mappable, "Buffer {} is not mappable", self.name);
        assert!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Writing past the end of buffer {}",
            self.name
        );

        if let Some(mapped) = self.mapped_slice_mut() {
            mapped[..bytes.len()].copy_from_slice(bytes);
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn is_mappable(&self) -> bool {
        self.is_mappable
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Vertex data, either uploaded once or updated through the mapping
pub struct VertexBuffer(Buffer);

impl VertexBuffer {
    pub fn new(device: DeviceRef, name: &str) -> Self {
        Self(Buffer::new(device, BufferKind::Vertex, name))
    }

    pub fn create_static<T: Pod>(&mut self, vertices: &[T]) -> Result<()> {
        self.0.create_from(vertices)
    }

    pub fn create_dynamic<T: Pod>(&mut self, vertex_count: u32) -> Result<()> {
        self.0.create_for::<T>(vertex_count)
    }

    pub fn vertex_count(&self) -> u32 {
        self.0.element_count()
    }
}

impl Deref for VertexBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.0
    }
}

impl DerefMut for VertexBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.0
    }
}

/// 16 or 32 bit indices
pub struct IndexBuffer(Buffer);

impl IndexBuffer {
    pub fn new(device: DeviceRef, name: &str) -> Self {
        Self(Buffer::new(device, BufferKind::Index, name))
    }

    pub fn create_static<T: Pod>(&mut self, indices: &[T]) -> Result<()> {
        assert_index_size::<T>();
        self.0.create_from(indices)
    }

    pub fn create_dynamic<T: Pod>(&mut self, index_count: u32) -> Result<()> {
        assert_index_size::<T>();
        self.0.create_for::<T>(index_count)
    }

    pub fn index_count(&self) -> u32 {
        self.0.element_count()
    }

    pub fn index_type(&self) -> vk::IndexType {
        if self.0.stride() == 2 {
            vk::IndexType::UINT16
        } else {
            vk::IndexType::UINT32
        }
    }
}

fn assert_index_size<T>() {
    let size = std::mem::size_of::<T>();
    assert!(size == 2 || size == 4, "Indices must be 16 or 32 bit, got {} bytes", size);
}

impl Deref for IndexBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.0
    }
}

impl DerefMut for IndexBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockDevice};
    use crate::backend::RhiDevice;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    struct Vertex {
        position: [f32; 2],
        color: [f32; 3],
    }

    const TRIANGLE: [Vertex; 3] = [
        Vertex { position: [0.0, -0.5], color: [1.0, 0.0, 0.0] },
        Vertex { position: [0.5, 0.5], color: [0.0, 1.0, 0.0] },
        Vertex { position: [-0.5, 0.5], color: [0.0, 0.0, 1.0] },
    ];

    #[test]
    fn static_buffer_is_uploaded_through_staging() {
        let device = MockDevice::new();
        let mut vertices = VertexBuffer::new(device.clone(), "triangle");
        vertices.create_static(&TRIANGLE).unwrap();

        assert!(!vertices.is_mappable());
        assert!(vertices.map().is_none());
        assert_eq!(vertices.vertex_count(), 3);
        assert_eq!(vertices.stride() as usize, std::mem::size_of::<Vertex>());
        assert_eq!(
            device.buffer_contents(vertices.handle()).unwrap(),
            bytemuck::cast_slice::<_, u8>(&TRIANGLE)
        );

        // Staging is gone, only the destination remains
        assert_eq!(device.live_buffers(), 1);
        let size = std::mem::size_of_val(&TRIANGLE) as u64;
        let calls = device.calls();
        assert!(calls.contains(&Call::CreateBuffer {
            size,
            location: MemoryLocation::CpuToGpu,
            with_data: true,
        }));
        assert!(calls.contains(&Call::CreateBuffer {
            size,
            location: MemoryLocation::GpuOnly,
            with_data: false,
        }));
        assert_eq!(device.count_calls(|c| matches!(c, Call::CopyBuffer { .. })), 1);
    }

    #[test]
    fn failed_upload_frees_the_command_buffer() {
        let device = MockDevice::new();
        let mut vertices = VertexBuffer::new(device.clone(), "triangle");

        device.fail_next_submit();
        assert!(vertices.create_static(&TRIANGLE).is_err());
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.count_calls(|c| matches!(c, Call::QueueWaitAll)), 1);

        // Nothing left behind blocks a retry
        vertices.create_static(&TRIANGLE).unwrap();
        assert_eq!(device.live_command_buffers(), 0);
    }

    #[test]
    fn dynamic_buffer_keeps_its_mapping() {
        let device = MockDevice::new();
        let mut vertices = VertexBuffer::new(device.clone(), "dynamic");
        vertices.create_dynamic::<Vertex>(3).unwrap();

        let mapped = vertices.map();
        assert!(mapped.is_some());
        vertices.write(&TRIANGLE);
        vertices.unmap();
        assert_eq!(vertices.map(), mapped);

        assert_eq!(
            device.buffer_contents(vertices.handle()).unwrap(),
            bytemuck::cast_slice::<_, u8>(&TRIANGLE)
        );
        assert_eq!(device.count_calls(|c| matches!(c, Call::CopyBuffer { .. })), 0);
    }

    #[test]
    fn recreating_retires_the_old_storage() {
        let device = MockDevice::new();
        let mut vertices = VertexBuffer::new(device.clone(), "triangle");
        vertices.create_static(&TRIANGLE).unwrap();
        let old = vertices.handle();

        vertices.create_dynamic::<Vertex>(16).unwrap();

        assert_ne!(vertices.handle(), old);
        assert_eq!(device.deletion_queue().len(), 1);
        assert_eq!(device.live_buffers(), 2);
        assert_eq!(device.process_deletion_queue().unwrap(), 1);
        assert!(device.buffer_contents(old).is_none());
    }

    #[test]
    fn drop_defers_destruction() {
        let device = MockDevice::new();
        let mut indices = IndexBuffer::new(device.clone(), "indices");
        indices.create_static(&[0u16, 1, 2]).unwrap();
        drop(indices);

        assert_eq!(device.live_buffers(), 1);
        device.process_deletion_queue().unwrap();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn pending_work_holds_back_deletion() {
        let device = MockDevice::new();
        let mut vertices = VertexBuffer::new(device.clone(), "dynamic");
        vertices.create_dynamic::<Vertex>(3).unwrap();

        device.set_auto_complete(false);
        let cmd = device.allocate_command_buffer().unwrap();
        let submission = device.queue_submit(cmd, &[], &[]).unwrap();
        drop(vertices);

        assert_eq!(device.process_deletion_queue().unwrap(), 0);
        device.complete_submissions(submission);
        assert_eq!(device.process_deletion_queue().unwrap(), 1);
    }

    #[test]
    fn index_type_follows_the_element_size() {
        let device = MockDevice::new();
        let mut small = IndexBuffer::new(device.clone(), "small");
        small.create_static(&[0u16, 1, 2]).unwrap();
        let mut large = IndexBuffer::new(device.clone(), "large");
        large.create_dynamic::<u32>(6).unwrap();

        assert_eq!(small.index_type(), vk::IndexType::UINT16);
        assert_eq!(small.index_count(), 3);
        assert_eq!(large.index_type(), vk::IndexType::UINT32);
        assert_eq!(large.size(), 24);
    }

    #[test]
    #[should_panic(expected = "is not mappable")]
    fn writing_to_a_staged_buffer_panics() {
        let mut vertices = VertexBuffer::new(MockDevice::new(), "triangle");
        vertices.create_static(&TRIANGLE).unwrap();
        vertices.write(&TRIANGLE);
    }
}
