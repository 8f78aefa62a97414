//! Resource manager
//!
//! Owns the mesh, material and texture pools together with the GPU objects
//! inside them. Loading is content-addressed: a key that is already live
//! returns its existing handle without touching the device.
//!
//! ```text
//! load_mesh(key, data)
//!     ├── key live → handle
//!     └── validate → tangents → resolve materials → upload buffers → build BLAS
//! ```
//!
//! Any change marks the scene buffer dirty.

use std::path::Path;
use crate::accel::{BlasBuilder, BlasSource};
use crate::assets::{ImageData, MeshData, ObjLoader};
use crate::core::RenderContext;
use crate::error::{EngineError, EngineResult};
use crate::render::allocator::GpuAllocator;
use crate::render::device::DeviceAddress;
use crate::resources::handle::ResourceHandle;
use crate::resources::material::{Material, MaterialDesc, MaterialFactors};
use crate::resources::mesh::Mesh;
use crate::resources::pool::{PoolError, ResourcePool};
use crate::resources::texture::{DefaultTextures, Texture, TextureKey, TextureType};

/// Key of the built-in material; reserved
pub const DEFAULT_MATERIAL_KEY: &str = "default";

/// Pools of device resources
pub struct ResourceManager {
    allocator: GpuAllocator,
    blas_builder: BlasBuilder,
    meshes: ResourcePool<String, Mesh>,
    materials: ResourcePool<String, Material>,
    textures: ResourcePool<TextureKey, Texture>,
    defaults: DefaultTextures,
    default_material: ResourceHandle,
    mesh_evictions: u64,
    dirty: bool,
}

impl ResourceManager {
    /// Create the pools and upload the fallback textures and default material
    pub fn new(context: &RenderContext) -> EngineResult<Self> {
        let pools = &context.config().pools;
        let allocator = context.allocator().clone();
        let mut textures = ResourcePool::new("texture", pools.texture_capacity);
        let mut materials = ResourcePool::new("material", pools.material_capacity);

        let mut fallback = [ResourceHandle::INVALID; 5];
        for kind in TextureType::ALL {
            let image = ImageData::solid_color(1, 1, kind.fallback_texel());
            fallback[kind.slot()] = textures.create(TextureKey::Fallback(kind), || {
                Texture::upload(&allocator, &image, kind.format()).map_err(EngineError::from)
            })?;
        }
        let defaults = DefaultTextures::new(fallback);
        let default_material = materials.create(DEFAULT_MATERIAL_KEY.to_string(), || {
            Ok::<_, EngineError>(Material::with_defaults(MaterialFactors::default(), &defaults))
        })?;

        log::info!(
            "Resource manager ready: {} meshes, {} materials, {} textures",
            pools.mesh_capacity,
            pools.material_capacity,
            pools.texture_capacity
        );

        Ok(Self {
            blas_builder: BlasBuilder::new(context),
            meshes: ResourcePool::new("mesh", pools.mesh_capacity),
            materials,
            textures,
            allocator,
            defaults,
            default_material,
            mesh_evictions: 0,
            dirty: true,
        })
    }

    /// Upload a mesh and build its BLAS, or return the live handle for `key`
    ///
    /// Primitives whose material name is not a live material key use the
    /// default material.
    pub fn load_mesh(&mut self, key: &str, data: &MeshData) -> EngineResult<ResourceHandle> {
        if let Some(handle) = self.meshes.handle_for(&key.to_string()) {
            return Ok(handle);
        }
        data.validate()?;

        let prepared;
        let data = if data.has_tangents {
            data
        } else {
            let mut with_tangents = data.clone();
            with_tangents.ensure_tangents();
            prepared = with_tangents;
            &prepared
        };

        let materials: Vec<ResourceHandle> = data
            .primitives
            .iter()
            .map(|primitive| {
                primitive
                    .material
                    .as_ref()
                    .and_then(|name| self.materials.handle_for(name))
                    .unwrap_or(self.default_material)
            })
            .collect();

        let allocator = &self.allocator;
        let builder = &self.blas_builder;
        let handle = self.meshes.create(key.to_string(), || {
            Mesh::upload(allocator, builder, data, &materials).map_err(EngineError::from)
        })?;

        self.dirty = true;
        log::debug!(
            "Loaded mesh '{key}' as {handle}: {} vertices, {} triangles, {} primitives",
            data.vertices.len(),
            data.triangle_count(),
            data.primitives.len()
        );
        Ok(handle)
    }

    /// Parse an OBJ file and load it, keyed by its path
    pub fn load_obj<P: AsRef<Path>>(&mut self, path: P) -> EngineResult<ResourceHandle> {
        let key = path.as_ref().to_string_lossy().into_owned();
        if let Some(handle) = self.meshes.handle_for(&key) {
            return Ok(handle);
        }
        let data = ObjLoader::load_obj(path.as_ref())?;
        self.load_mesh(&key, &data)
    }

    /// Decode and upload an image file, or return the live handle for its path
    pub fn load_texture<P: AsRef<Path>>(&mut self, path: P, kind: TextureType) -> EngineResult<ResourceHandle> {
        let path = path.as_ref();
        let key = TextureKey::File(path.to_path_buf());
        if let Some(handle) = self.textures.handle_for(&key) {
            return Ok(handle);
        }
        let image = ImageData::from_file(path)?;
        self.insert_texture(key, &image, kind)
    }

    /// Upload caller-provided pixels under `name`
    pub fn create_texture(&mut self, name: &str, image: &ImageData, kind: TextureType) -> EngineResult<ResourceHandle> {
        self.insert_texture(TextureKey::Named(name.to_string()), image, kind)
    }

    fn insert_texture(&mut self, key: TextureKey, image: &ImageData, kind: TextureType) -> EngineResult<ResourceHandle> {
        let allocator = &self.allocator;
        let handle = self.textures.create(key, || {
            Texture::upload(allocator, image, kind.format()).map_err(EngineError::from)
        })?;
        self.dirty = true;
        Ok(handle)
    }

    /// Create a material, loading its textures; unset slots use the fallbacks
    pub fn create_material(&mut self, key: &str, desc: &MaterialDesc) -> EngineResult<ResourceHandle> {
        if let Some(handle) = self.materials.handle_for(&key.to_string()) {
            return Ok(handle);
        }

        let mut textures = [ResourceHandle::INVALID; 5];
        for kind in TextureType::ALL {
            textures[kind.slot()] = match desc.texture_path(kind) {
                Some(path) => self.load_texture(path, kind)?,
                None => self.defaults.get(kind),
            };
        }

        let handle = self.materials.create(key.to_string(), || {
            Ok::<_, EngineError>(Material::new(desc.factors, textures))
        })?;
        self.dirty = true;
        Ok(handle)
    }

    /// Free a mesh slot and release its buffers and BLAS
    ///
    /// Waits for the device first. Bumps the eviction epoch, so the next
    /// [`Scene::rebuild_tlas`](crate::scene::Scene::rebuild_tlas) drops any TLAS
    /// built before the eviction and fails with an invalid-handle error while
    /// a node still references the handle.
    pub fn evict_mesh(&mut self, handle: ResourceHandle) -> EngineResult<()> {
        self.meshes.get(handle)?;
        self.allocator.device().wait_idle()?;
        let mesh = self.meshes.free(handle)?;
        mesh.destroy(&self.allocator);
        self.mesh_evictions += 1;
        self.dirty = true;
        log::debug!("Evicted mesh {handle}");
        Ok(())
    }

    /// Free a material slot
    ///
    /// Refused for the default material and for materials used by a live mesh.
    pub fn evict_material(&mut self, handle: ResourceHandle) -> EngineResult<()> {
        self.materials.get(handle)?;
        if handle == self.default_material {
            return Err(EngineError::ResourceInUse {
                resource: format!("material {handle}"),
                reason: "built-in default".to_string(),
            });
        }
        if let Some((mesh, _)) = self.meshes.iter().find(|(_, mesh)| mesh.uses_material(handle)) {
            return Err(EngineError::ResourceInUse {
                resource: format!("material {handle}"),
                reason: format!("referenced by mesh {mesh}"),
            });
        }
        self.materials.free(handle)?;
        self.dirty = true;
        Ok(())
    }

    /// Free a texture slot and release its image
    ///
    /// Refused for fallbacks and for textures used by a live material.
    pub fn evict_texture(&mut self, handle: ResourceHandle) -> EngineResult<()> {
        self.textures.get(handle)?;
        if self.defaults.contains(handle) {
            return Err(EngineError::ResourceInUse {
                resource: format!("texture {handle}"),
                reason: "built-in fallback".to_string(),
            });
        }
        if let Some((material, _)) = self.materials.iter().find(|(_, m)| m.uses_texture(handle)) {
            return Err(EngineError::ResourceInUse {
                resource: format!("texture {handle}"),
                reason: format!("referenced by material {material}"),
            });
        }
        self.allocator.device().wait_idle()?;
        let texture = self.textures.free(handle)?;
        texture.destroy(&self.allocator);
        self.dirty = true;
        Ok(())
    }

    /// Live mesh
    pub fn mesh(&self, handle: ResourceHandle) -> Result<&Mesh, PoolError> {
        self.meshes.get(handle)
    }

    /// Live material
    pub fn material(&self, handle: ResourceHandle) -> Result<&Material, PoolError> {
        self.materials.get(handle)
    }

    /// Live texture
    pub fn texture(&self, handle: ResourceHandle) -> Result<&Texture, PoolError> {
        self.textures.get(handle)
    }

    /// Handle of a live mesh key
    pub fn mesh_handle(&self, key: &str) -> Option<ResourceHandle> {
        self.meshes.handle_for(&key.to_string())
    }

    /// Handle of a live material key
    pub fn material_handle(&self, key: &str) -> Option<ResourceHandle> {
        self.materials.handle_for(&key.to_string())
    }

    pub fn meshes(&self) -> &ResourcePool<String, Mesh> {
        &self.meshes
    }

    pub fn materials(&self) -> &ResourcePool<String, Material> {
        &self.materials
    }

    pub fn textures(&self) -> &ResourcePool<TextureKey, Texture> {
        &self.textures
    }

    pub fn default_textures(&self) -> &DefaultTextures {
        &self.defaults
    }

    pub fn default_material(&self) -> ResourceHandle {
        self.default_material
    }

    /// Whether anything changed since the scene buffer was last written
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl BlasSource for ResourceManager {
    fn blas_address(&self, mesh: ResourceHandle) -> Result<DeviceAddress, PoolError> {
        self.meshes.get(mesh).map(Mesh::blas_address)
    }

    fn eviction_epoch(&self) -> u64 {
        self.mesh_evictions
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.device().wait_idle() {
            log::error!("wait_idle before releasing resources failed: {e}");
        }
        let (meshes, textures) = (self.meshes.drain(), self.textures.drain());
        log::debug!("Releasing {} meshes and {} textures", meshes.len(), textures.len());
        for mesh in meshes {
            mesh.destroy(&self.allocator);
        }
        for texture in textures {
            texture.destroy(&self.allocator);
        }
        self.materials.drain();
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("meshes", &self.meshes.len())
            .field("materials", &self.materials.len())
            .field("textures", &self.textures.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::assets::PrimitiveData;
    use crate::core::config::{EngineConfig, PoolConfig};
    use crate::error::ErrorCategory;
    use crate::render::recording::RecordingDevice;

    fn setup(pools: PoolConfig) -> (Arc<RecordingDevice>, ResourceManager) {
        crate::foundation::logging::init_for_tests();
        let device = Arc::new(RecordingDevice::new());
        let context = RenderContext::new(device.clone(), EngineConfig::default().with_pools(pools)).unwrap();
        let manager = ResourceManager::new(&context).unwrap();
        (device, manager)
    }

    #[test]
    fn test_defaults_are_created() {
        let (device, manager) = setup(PoolConfig::default());
        assert_eq!(manager.textures().len(), 5);
        assert_eq!(device.stats().images_created, 5);
        let material = manager.material(manager.default_material()).unwrap();
        assert_eq!(material.texture(TextureType::Normal), manager.default_textures().get(TextureType::Normal));
    }

    #[test]
    fn test_load_mesh_dedups_by_key() {
        let (device, mut manager) = setup(PoolConfig::default());
        let first = manager.load_mesh("cube", &MeshData::cube()).unwrap();
        let builds = device.stats().blas_builds;
        let second = manager.load_mesh("cube", &MeshData::triangle()).unwrap();
        assert_eq!(first, second);
        assert_eq!(device.stats().blas_builds, builds);
        assert_eq!(manager.mesh(first).unwrap().index_count(), 36);
    }

    #[test]
    fn test_primitive_materials_resolve_by_name() {
        let (_device, mut manager) = setup(PoolConfig::default());
        let red = manager
            .create_material("red", &MaterialDesc::default().with_base_color([1.0, 0.0, 0.0, 1.0]))
            .unwrap();

        let mut data = MeshData::cube();
        let half = data.indices.len() as u32 / 2;
        let mut first = data.primitives[0].clone();
        first.range.index_count = half;
        first.material = Some("red".to_string());
        let second = PrimitiveData {
            range: crate::assets::PrimitiveRange {
                base_index: half,
                ..first.range
            },
            material: Some("missing".to_string()),
        };
        data.primitives = vec![first, second];

        let mesh = manager.load_mesh("two-part", &data).unwrap();
        let primitives = manager.mesh(mesh).unwrap().primitives();
        assert_eq!(primitives[0].material, red);
        assert_eq!(primitives[1].material, manager.default_material());
        assert!(matches!(
            manager.evict_material(red),
            Err(EngineError::ResourceInUse { .. })
        ));
    }

    #[test]
    fn test_mesh_pool_exhaustion() {
        let (_device, mut manager) = setup(PoolConfig {
            mesh_capacity: 1,
            ..PoolConfig::default()
        });
        manager.load_mesh("a", &MeshData::triangle()).unwrap();
        let err = manager.load_mesh("b", &MeshData::triangle()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn test_evict_mesh_releases_gpu_objects() {
        let (device, mut manager) = setup(PoolConfig::default());
        let live_before = device.stats().live_buffers();
        let mesh = manager.load_mesh("tri", &MeshData::triangle()).unwrap();
        assert!(device.stats().live_buffers() > live_before);

        manager.evict_mesh(mesh).unwrap();
        assert_eq!(device.stats().live_buffers(), live_before);
        assert_eq!(device.stats().live_acceleration_structures(), 0);
        assert_eq!(
            manager.evict_mesh(mesh).unwrap_err().category(),
            ErrorCategory::InvalidHandle
        );
    }

    #[test]
    fn test_fallback_texture_cannot_be_evicted() {
        let (_device, mut manager) = setup(PoolConfig::default());
        let white = manager.default_textures().get(TextureType::BaseColor);
        assert!(manager.evict_texture(white).is_err());
        assert!(manager.texture(white).is_ok());
    }

    #[test]
    fn test_named_texture_dedup_and_eviction() {
        let (device, mut manager) = setup(PoolConfig::default());
        let image = ImageData::solid_color(2, 2, [10, 20, 30, 255]);
        let handle = manager.create_texture("checker", &image, TextureType::BaseColor).unwrap();
        assert_eq!(manager.create_texture("checker", &image, TextureType::BaseColor).unwrap(), handle);
        assert_eq!(device.stats().images_created, 6);

        manager.evict_texture(handle).unwrap();
        assert_eq!(device.stats().images_destroyed, 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (device, mut manager) = setup(PoolConfig::default());
        manager.load_mesh("cube", &MeshData::cube()).unwrap();
        drop(manager);
        let stats = device.stats();
        assert_eq!(stats.live_buffers(), 0);
        assert_eq!(stats.live_acceleration_structures(), 0);
        assert_eq!(stats.images_created, stats.images_destroyed);
    }
}
