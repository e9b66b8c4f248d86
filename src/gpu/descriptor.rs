use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ash::vk::{self, Handle as VkHandle};

use super::error::{GPUError, Result};
use super::structs::ShaderStage;

// Reflected slots are shifted per kind so a merged vertex+pixel table can
// never collide across kinds.
pub const SAMPLER_SLOT_SHIFT: u32 = 0;
pub const TEXTURE_SLOT_SHIFT: u32 = 100;
pub const STORAGE_TEXTURE_SLOT_SHIFT: u32 = 200;
pub const CONSTANT_BUFFER_SLOT_SHIFT: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Sampler,
    Texture,
    TextureStorage,
    ConstantBuffer,
    ConstantBufferDynamic,
}

impl DescriptorKind {
    pub fn slot_shift(self) -> u32 {
        match self {
            DescriptorKind::Sampler => SAMPLER_SLOT_SHIFT,
            DescriptorKind::Texture => TEXTURE_SLOT_SHIFT,
            DescriptorKind::TextureStorage => STORAGE_TEXTURE_SLOT_SHIFT,
            DescriptorKind::ConstantBuffer | DescriptorKind::ConstantBufferDynamic => {
                CONSTANT_BUFFER_SLOT_SHIFT
            }
        }
    }

    pub(crate) fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorKind::Texture => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::TextureStorage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::ConstantBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        }
    }
}

/// One shader-visible binding point. The shape half `(kind, slot, stages)`
/// identifies the binding; the value half tracks what is currently bound.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    /// Kind-shifted slot index.
    pub slot: u32,
    pub stages: ShaderStage,
    pub resource: u64,
    pub offset: u32,
    pub range: u32,
    pub dynamic_offset: u32,
    pub layout: vk::ImageLayout,
}

impl Descriptor {
    pub fn shape(kind: DescriptorKind, unshifted_slot: u32, stages: ShaderStage) -> Self {
        Self {
            kind,
            slot: unshifted_slot + kind.slot_shift(),
            stages,
            resource: 0,
            offset: 0,
            range: 0,
            dynamic_offset: 0,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// Merges a second stage's reflected bindings into `base`. A `(kind, slot)`
/// match is the same binding seen from another stage, so only the stage mask
/// widens; anything else is appended.
pub fn merge_descriptors(base: &mut Vec<Descriptor>, other: &[Descriptor]) {
    for incoming in other {
        match base
            .iter_mut()
            .find(|d| d.kind == incoming.kind && d.slot == incoming.slot)
        {
            Some(existing) => existing.stages |= incoming.stages,
            None => base.push(*incoming),
        }
    }
}

/// Rewrites constant buffers on the listed user slots as dynamic. Runs after
/// merging, before shape hashing, so dynamic-ness is part of layout identity.
pub fn flag_dynamic_slots(descriptors: &mut [Descriptor], dynamic_slots: &[u32]) {
    for d in descriptors.iter_mut() {
        if d.kind == DescriptorKind::ConstantBuffer
            && dynamic_slots
                .iter()
                .any(|slot| slot + CONSTANT_BUFFER_SLOT_SHIFT == d.slot)
        {
            d.kind = DescriptorKind::ConstantBufferDynamic;
        }
    }
}

/// Hash over binding shapes only. Bound values never affect layout identity.
pub fn shape_hash(descriptors: &[Descriptor]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for d in descriptors {
        d.kind.hash(&mut hasher);
        d.slot.hash(&mut hasher);
        d.stages.bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Shape hash combined with every bound resource identity. Dynamic offsets
/// are deliberately excluded: changing one rebinds the existing set rather
/// than producing a new one.
pub fn value_hash(shape: u64, descriptors: &[Descriptor]) -> u64 {
    let mut hasher = DefaultHasher::new();
    shape.hash(&mut hasher);
    for d in descriptors {
        d.resource.hash(&mut hasher);
        d.offset.hash(&mut hasher);
        d.range.hash(&mut hasher);
    }
    hasher.finish()
}

/// A concrete allocated set for one specific resource assignment.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorSet {
    pub(crate) raw: vk::DescriptorSet,
}

/// The shape shared by every set in `sets`, plus the live binding values the
/// next retrieval will resolve against.
pub struct DescriptorSetLayout {
    pub(crate) raw: vk::DescriptorSetLayout,
    pub(crate) name: String,
    pub(crate) shape: u64,
    pub(crate) descriptors: Vec<Descriptor>,
    pub(crate) sets: HashMap<u64, DescriptorSet>,
    pub(crate) needs_rebind: bool,
}

/// What a retrieval resolved to: a set that must be (re)bound together with
/// its dense dynamic offsets, or nothing because the bound set is current.
pub struct ResolvedSet {
    pub set: vk::DescriptorSet,
    pub dynamic_offsets: Vec<u32>,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        raw: vk::DescriptorSetLayout,
        name: String,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        let shape = shape_hash(&descriptors);
        Self {
            raw,
            name,
            shape,
            descriptors,
            sets: HashMap::new(),
            needs_rebind: true,
        }
    }

    pub fn shape(&self) -> u64 {
        self.shape
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    // Matching on the shifted slot alone is not enough: the shifts are only
    // 100 apart, so a sampler at user slot 100 would land on a texture at
    // user slot 0. The kind's own shift disambiguates, and conveniently
    // treats the two constant-buffer kinds as one family.
    fn find_mut(&mut self, kind_shift: u32, slot: u32) -> Option<&mut Descriptor> {
        let shifted = slot + kind_shift;
        self.descriptors
            .iter_mut()
            .find(|d| d.slot == shifted && d.kind.slot_shift() == kind_shift)
    }

    pub fn set_constant_buffer(
        &mut self,
        slot: u32,
        resource: u64,
        offset: u32,
        range: u32,
        dynamic_offset: u32,
    ) {
        let mut dirty = false;
        if let Some(d) = self.find_mut(CONSTANT_BUFFER_SLOT_SHIFT, slot) {
            if d.resource != resource || d.offset != offset || d.range != range {
                d.resource = resource;
                d.offset = offset;
                d.range = range;
                dirty = true;
            }
            // A dynamic offset change affects the bind call only; the set's
            // contents stay valid.
            if d.kind == DescriptorKind::ConstantBufferDynamic && d.dynamic_offset != dynamic_offset
            {
                d.dynamic_offset = dynamic_offset;
                dirty = true;
            }
        }
        if dirty {
            self.needs_rebind = true;
        }
    }

    pub fn set_sampler(&mut self, slot: u32, resource: u64) {
        let mut dirty = false;
        if let Some(d) = self.find_mut(SAMPLER_SLOT_SHIFT, slot) {
            if d.resource != resource {
                d.resource = resource;
                dirty = true;
            }
        }
        if dirty {
            self.needs_rebind = true;
        }
    }

    pub fn set_texture(&mut self, slot: u32, resource: u64, layout: vk::ImageLayout, storage: bool) {
        let shift = if storage {
            STORAGE_TEXTURE_SLOT_SHIFT
        } else {
            TEXTURE_SLOT_SHIFT
        };
        let mut dirty = false;
        if let Some(d) = self.find_mut(shift, slot) {
            if d.resource != resource || d.layout != layout {
                d.resource = resource;
                d.layout = layout;
                dirty = true;
            }
        }
        if dirty {
            self.needs_rebind = true;
        }
    }

    /// Dense dynamic-offset array in slot order; bind calls require no gaps.
    pub fn dynamic_offsets(&self) -> Vec<u32> {
        let mut dynamic: Vec<&Descriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.kind == DescriptorKind::ConstantBufferDynamic)
            .collect();
        dynamic.sort_by_key(|d| d.slot);
        dynamic.iter().map(|d| d.dynamic_offset).collect()
    }

    /// Resolves the current binding values to a concrete set.
    ///
    /// Returns `Ok(None)` when nothing changed since the last retrieval,
    /// `Ok(Some(..))` when the caller must (re)bind, and
    /// `Err(DescriptorPoolExhausted)` when allocating a fresh set would
    /// exceed `capacity` given `live_sets` already allocated across the
    /// whole cache. The caller grows the pool and retries next frame.
    pub(crate) fn retrieve_descriptor_set(
        &mut self,
        device: &ash::Device,
        pool: vk::DescriptorPool,
        capacity: u32,
        live_sets: u32,
    ) -> Result<Option<ResolvedSet>> {
        let vhash = value_hash(self.shape, &self.descriptors);

        if let Some(existing) = self.sets.get(&vhash) {
            if self.needs_rebind {
                self.needs_rebind = false;
                return Ok(Some(ResolvedSet {
                    set: existing.raw,
                    dynamic_offsets: self.dynamic_offsets(),
                }));
            }
            return Ok(None);
        }

        if live_sets + 1 > capacity {
            return Err(GPUError::DescriptorPoolExhausted { capacity });
        }

        let layouts = [self.raw];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let raw = unsafe { device.allocate_descriptor_sets(&alloc_info)? }[0];

        self.write_set(device, raw);
        self.sets.insert(vhash, DescriptorSet { raw });
        self.needs_rebind = false;
        Ok(Some(ResolvedSet {
            set: raw,
            dynamic_offsets: self.dynamic_offsets(),
        }))
    }

    fn write_set(&self, device: &ash::Device, set: vk::DescriptorSet) {
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        // Two passes so the info vectors never reallocate under the writes.
        for d in self.descriptors.iter().filter(|d| d.resource != 0) {
            match d.kind {
                DescriptorKind::ConstantBuffer | DescriptorKind::ConstantBufferDynamic => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(d.resource),
                        offset: d.offset as u64,
                        range: if d.range == 0 {
                            vk::WHOLE_SIZE
                        } else {
                            d.range as u64
                        },
                    });
                }
                DescriptorKind::Texture | DescriptorKind::TextureStorage => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk::ImageView::from_raw(d.resource),
                        image_layout: d.layout,
                    });
                }
                DescriptorKind::Sampler => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::from_raw(d.resource),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                }
            }
        }

        let mut writes = Vec::new();
        let mut next_buffer = 0;
        let mut next_image = 0;
        for d in self.descriptors.iter().filter(|d| d.resource != 0) {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(d.slot)
                .descriptor_type(d.kind.to_vk());
            match d.kind {
                DescriptorKind::ConstantBuffer | DescriptorKind::ConstantBufferDynamic => {
                    write = write.buffer_info(&buffer_infos[next_buffer..next_buffer + 1]);
                    next_buffer += 1;
                }
                _ => {
                    write = write.image_info(&image_infos[next_image..next_image + 1]);
                    next_image += 1;
                }
            }
            writes.push(write.build());
        }

        if !writes.is_empty() {
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
    }
}
