//! Scene: one root, an entity store and the TLAS mirroring it
//!
//! Per frame:
//!
//! ```text
//! let token = scene.update(dt);                 // traversal refresh + propagation
//! scene.rebuild_tlas(token, &resources)?;       // no-op unless instances changed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use crate::accel::{BlasSource, TlasInstance, TlasSynchronizer};
use crate::core::RenderContext;
use crate::ecs::components::{LocalTransform, Name, RenderComponent, SceneGraphNode, WorldTransform};
use crate::ecs::{Entity, World};
use crate::error::EngineResult;
use crate::foundation::math::{Mat4, Quat, Vec3};
use crate::render::device::DeviceAddress;
use crate::resources::ResourceHandle;
use crate::scene::scene_graph::{DirtyFlags, PropagationStats, SceneGraph, TransformsPropagated, TraversalStep};
use crate::scene::SceneError;

static NEXT_SCENE_ID: AtomicU64 = AtomicU64::new(1);

/// A scene graph with its top-level acceleration structure
pub struct Scene {
    id: u64,
    world: World,
    root: Entity,
    graph: SceneGraph,
    tlas: TlasSynchronizer,
    epoch: u64,
    built_eviction_epoch: u64,
    last_propagation: PropagationStats,
}

impl Scene {
    /// Create a scene holding only the root
    pub fn new(context: &RenderContext) -> Self {
        let mut world = World::new();
        let root = world.spawn();
        // Inserts into a freshly spawned entity cannot be refused.
        let inserted = world.insert(root, SceneGraphNode::default()).is_ok()
            && world.insert(root, LocalTransform::identity()).is_ok()
            && world.insert(root, WorldTransform::default()).is_ok()
            && world.insert(root, Name("root".to_string())).is_ok();
        debug_assert!(inserted, "root components rejected");

        Self {
            id: NEXT_SCENE_ID.fetch_add(1, Ordering::Relaxed),
            world,
            root,
            graph: SceneGraph::new(),
            tlas: TlasSynchronizer::new(context),
            epoch: 0,
            built_eviction_epoch: 0,
            last_propagation: PropagationStats::default(),
        }
    }

    /// The root node
    ///
    /// The root and its direct children use their local matrix as their world
    /// matrix.
    pub fn root(&self) -> Entity {
        self.root
    }

    /// Read access to the entity store
    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn dirty_flags(&self) -> DirtyFlags {
        self.graph.flags()
    }

    /// Traversal buffer as of the last [`update`](Self::update)
    pub fn traversal(&self) -> &[TraversalStep] {
        self.graph.traversal()
    }

    /// Counters of the last propagation
    pub fn last_propagation(&self) -> PropagationStats {
        self.last_propagation
    }

    /// TLAS owner
    pub fn tlas(&self) -> &TlasSynchronizer {
        &self.tlas
    }

    /// Address of the current TLAS, once one has been built
    pub fn tlas_address(&self) -> Option<DeviceAddress> {
        self.tlas.device_address()
    }

    fn touch(&mut self, flags: DirtyFlags) {
        self.epoch += 1;
        self.graph.mark(flags);
    }

    fn require_node(&self, entity: Entity) -> Result<(), SceneError> {
        if !self.world.is_alive(entity) {
            return Err(SceneError::EntityNotFound(entity));
        }
        if !self.world.has::<SceneGraphNode>(entity) {
            return Err(SceneError::NotInGraph(entity));
        }
        Ok(())
    }

    fn node(&self, entity: Entity) -> Result<&SceneGraphNode, SceneError> {
        self.require_node(entity)?;
        self.world
            .get::<SceneGraphNode>(entity)
            .ok_or(SceneError::NotInGraph(entity))
    }

    fn node_mut(&mut self, entity: Entity) -> Result<&mut SceneGraphNode, SceneError> {
        self.require_node(entity)?;
        self.world
            .get_mut::<SceneGraphNode>(entity)
            .ok_or(SceneError::NotInGraph(entity))
    }

    /// Spawn an entity outside the graph, to be attached with
    /// [`add_node`](Self::add_node)
    pub fn spawn(&mut self) -> Entity {
        self.world.spawn()
    }

    /// Spawn a node under `parent`
    pub fn create_node(&mut self, parent: Entity, local: LocalTransform) -> Result<Entity, SceneError> {
        self.require_node(parent)?;
        let entity = self.world.spawn();
        self.world
            .insert(entity, local)
            .map_err(|_| SceneError::EntityNotFound(entity))?;
        self.add_node(parent, entity)?;
        Ok(entity)
    }

    /// Attach an existing entity under `parent`
    ///
    /// The entity keeps its local transform if it has one, otherwise it gets
    /// the identity. Either way it is recomposed on the next update.
    pub fn add_node(&mut self, parent: Entity, entity: Entity) -> Result<(), SceneError> {
        if !self.world.is_alive(entity) {
            return Err(SceneError::EntityNotFound(entity));
        }
        if self.world.has::<SceneGraphNode>(entity) {
            return Err(SceneError::AlreadyInGraph(entity));
        }
        self.node_mut(parent)?.children.push(entity);

        self.world
            .insert(entity, SceneGraphNode::with_parent(parent))
            .map_err(|_| SceneError::EntityNotFound(entity))?;
        match self.world.get_mut::<LocalTransform>(entity) {
            Some(local) => local.mark_dirty(),
            None => {
                self.world
                    .insert(entity, LocalTransform::identity())
                    .map_err(|_| SceneError::EntityNotFound(entity))?;
            }
        }
        self.world
            .insert(entity, WorldTransform::default())
            .map_err(|_| SceneError::EntityNotFound(entity))?;

        self.touch(DirtyFlags::SCENE_GRAPH | DirtyFlags::TLAS);
        Ok(())
    }

    /// Remove a node and its whole subtree, returning how many nodes went
    pub fn remove_node(&mut self, entity: Entity) -> Result<usize, SceneError> {
        if entity == self.root {
            return Err(SceneError::RootIsFixed);
        }
        let parent = self.node(entity)?.parent;
        if let Some(parent) = parent {
            if let Some(node) = self.world.get_mut::<SceneGraphNode>(parent) {
                node.remove_child(entity);
            }
        }

        let mut removed = 0;
        let mut had_instances = false;
        let mut stack = vec![entity];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.world.get::<SceneGraphNode>(next) {
                stack.extend_from_slice(&node.children);
            }
            had_instances |= self.world.has::<RenderComponent>(next);
            if self.world.despawn(next) {
                removed += 1;
            }
        }

        let flags = if had_instances {
            DirtyFlags::SCENE_GRAPH | DirtyFlags::TLAS
        } else {
            DirtyFlags::SCENE_GRAPH
        };
        self.touch(flags);
        log::debug!("Removed {removed} nodes under {entity}");
        Ok(removed)
    }

    /// Move `entity` (with its subtree) under `new_parent`
    ///
    /// The local transform is kept, so the world placement changes with the
    /// new parent.
    pub fn reparent(&mut self, entity: Entity, new_parent: Entity) -> Result<(), SceneError> {
        if entity == self.root {
            return Err(SceneError::RootIsFixed);
        }
        let old_parent = self.node(entity)?.parent;
        self.require_node(new_parent)?;
        if old_parent == Some(new_parent) {
            return Ok(());
        }

        let mut ancestor = Some(new_parent);
        while let Some(current) = ancestor {
            if current == entity {
                return Err(SceneError::CycleDetected {
                    entity,
                    parent: new_parent,
                });
            }
            ancestor = self.world.get::<SceneGraphNode>(current).and_then(|n| n.parent);
        }

        if let Some(old) = old_parent {
            if let Some(node) = self.world.get_mut::<SceneGraphNode>(old) {
                node.remove_child(entity);
            }
        }
        self.node_mut(new_parent)?.children.push(entity);
        self.node_mut(entity)?.parent = Some(new_parent);
        if let Some(local) = self.world.get_mut::<LocalTransform>(entity) {
            local.mark_dirty();
        }

        self.touch(DirtyFlags::SCENE_GRAPH);
        Ok(())
    }

    /// Make `entity` an instance of `mesh`, replacing any previous mesh
    ///
    /// `mesh` must have a built BLAS in `meshes`.
    pub fn attach_mesh<B>(&mut self, entity: Entity, mesh: ResourceHandle, meshes: &B) -> Result<(), SceneError>
    where
        B: BlasSource + ?Sized,
    {
        self.require_node(entity)?;
        if meshes.blas_address(mesh).is_err() {
            return Err(SceneError::MeshNotLoaded(mesh));
        }
        self.world
            .insert(entity, RenderComponent { mesh })
            .map_err(|_| SceneError::EntityNotFound(entity))?;
        self.touch(DirtyFlags::TLAS);
        Ok(())
    }

    /// Stop instancing a mesh at `entity`, returning the mesh it had
    pub fn detach_mesh(&mut self, entity: Entity) -> Result<Option<ResourceHandle>, SceneError> {
        self.require_node(entity)?;
        let removed = self.world.remove::<RenderComponent>(entity).map(|r| r.mesh);
        if removed.is_some() {
            self.touch(DirtyFlags::TLAS);
        }
        Ok(removed)
    }

    /// Mesh instanced at `entity`
    pub fn mesh_of(&self, entity: Entity) -> Option<ResourceHandle> {
        self.world.get::<RenderComponent>(entity).map(|r| r.mesh)
    }

    /// Attach a debug name
    pub fn set_name(&mut self, entity: Entity, name: &str) -> Result<(), SceneError> {
        self.world
            .insert(entity, Name(name.to_string()))
            .map(drop)
            .map_err(|_| SceneError::EntityNotFound(entity))
    }

    fn local_mut(&mut self, entity: Entity) -> Result<&mut LocalTransform, SceneError> {
        self.require_node(entity)?;
        self.epoch += 1;
        self.world
            .get_mut::<LocalTransform>(entity)
            .ok_or(SceneError::NotInGraph(entity))
    }

    /// Replace the local transform; it is recomposed on the next update
    pub fn set_local_transform(&mut self, entity: Entity, local: LocalTransform) -> Result<(), SceneError> {
        let slot = self.local_mut(entity)?;
        *slot = local;
        slot.mark_dirty();
        Ok(())
    }

    pub fn set_translation(&mut self, entity: Entity, translation: Vec3) -> Result<(), SceneError> {
        self.local_mut(entity)?.set_translation(translation);
        Ok(())
    }

    pub fn set_rotation(&mut self, entity: Entity, rotation: Quat) -> Result<(), SceneError> {
        self.local_mut(entity)?.set_rotation(rotation);
        Ok(())
    }

    pub fn set_scale(&mut self, entity: Entity, scale: Vec3) -> Result<(), SceneError> {
        self.local_mut(entity)?.set_scale(scale);
        Ok(())
    }

    pub fn local_transform(&self, entity: Entity) -> Option<&LocalTransform> {
        self.world.get::<LocalTransform>(entity)
    }

    /// World matrix as of the last update
    pub fn world_matrix(&self, entity: Entity) -> Option<&Mat4> {
        self.world.get::<WorldTransform>(entity).map(|w| &w.matrix)
    }

    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.world.get::<SceneGraphNode>(entity).and_then(|n| n.parent)
    }

    /// Children in insertion order
    pub fn children(&self, entity: Entity) -> &[Entity] {
        self.world
            .get::<SceneGraphNode>(entity)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// Number of nodes in the graph, root included
    pub fn node_count(&self) -> usize {
        self.world.storage::<SceneGraphNode>().map_or(0, |s| s.len())
    }

    /// Refresh the traversal buffer if needed and propagate world transforms
    pub fn update(&mut self, dt: f32) -> TransformsPropagated {
        self.graph.refresh_traversal(&self.world, self.root);
        self.last_propagation = self.graph.propagate(&mut self.world);
        log::trace!(
            "Scene update (dt={dt:.4}): {} visits, {} recomposed",
            self.last_propagation.visits,
            self.last_propagation.recomposed
        );
        TransformsPropagated::new(self.id, self.epoch)
    }

    /// Rebuild the TLAS from every node with a mesh, if anything changed
    ///
    /// Returns whether device work was done. Custom instance indices are the
    /// mesh slot indices.
    pub fn rebuild_tlas<B>(&mut self, token: TransformsPropagated, meshes: &B) -> EngineResult<bool>
    where
        B: BlasSource + ?Sized,
    {
        if token.scene_id() != self.id {
            return Err(SceneError::ForeignToken.into());
        }
        if token.epoch() != self.epoch {
            return Err(SceneError::StaleTransforms.into());
        }

        let evictions = meshes.eviction_epoch();
        let evicted_since_build = self.tlas.is_initialized() && evictions != self.built_eviction_epoch;
        if evicted_since_build {
            self.graph.mark(DirtyFlags::TLAS);
        }
        if !self.graph.flags().contains(DirtyFlags::TLAS) {
            self.tlas.record_skip();
            return Ok(false);
        }

        let instances = match self.gather_instances(meshes) {
            Ok(instances) => instances,
            Err(e) => {
                if evicted_since_build {
                    // The old TLAS may reference a destroyed BLAS.
                    self.tlas.invalidate()?;
                }
                return Err(e);
            }
        };
        self.tlas.synchronize(&instances)?;
        self.built_eviction_epoch = evictions;
        self.graph.clear(DirtyFlags::TLAS);
        Ok(true)
    }

    /// Instances for every node that has both a world transform and a mesh
    pub fn gather_instances<B>(&self, meshes: &B) -> EngineResult<Vec<TlasInstance>>
    where
        B: BlasSource + ?Sized,
    {
        self.world
            .join::<WorldTransform, RenderComponent>()
            .into_iter()
            .map(|(_, world, render)| -> EngineResult<TlasInstance> {
                let address = meshes.blas_address(render.mesh)?;
                Ok(TlasInstance::new(&world.matrix, render.mesh.index(), address))
            })
            .collect()
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("root", &self.root)
            .field("nodes", &self.node_count())
            .field("flags", &self.graph.flags())
            .field("tlas", &self.tlas)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use approx::assert_relative_eq;
    use crate::core::config::EngineConfig;
    use crate::error::ErrorCategory;
    use crate::render::recording::RecordingDevice;
    use crate::resources::PoolError;

    struct FakeMeshes(HashMap<ResourceHandle, DeviceAddress>);

    impl BlasSource for FakeMeshes {
        fn blas_address(&self, mesh: ResourceHandle) -> Result<DeviceAddress, PoolError> {
            self.0.get(&mesh).copied().ok_or(PoolError::InvalidHandle { pool: "mesh", handle: mesh })
        }
    }

    fn setup() -> (Arc<RecordingDevice>, Scene, FakeMeshes, ResourceHandle) {
        crate::foundation::logging::init_for_tests();
        let device = Arc::new(RecordingDevice::new());
        let context = RenderContext::new(device.clone(), EngineConfig::default()).unwrap();
        let mesh = ResourceHandle::new(3, 0);
        let meshes = FakeMeshes(HashMap::from([(mesh, 0xB000)]));
        (device, Scene::new(&context), meshes, mesh)
    }

    #[test]
    fn test_new_scene_root_carries_graph_components() {
        let (_device, scene, _meshes, _mesh) = setup();
        let root = scene.root();
        assert!(scene.world().has::<SceneGraphNode>(root));
        assert!(scene.world().has::<LocalTransform>(root));
        assert!(scene.world().has::<WorldTransform>(root));
        assert_eq!(scene.world().get::<Name>(root).map(|n| n.0.as_str()), Some("root"));
        assert_eq!(scene.node_count(), 1);
    }

    #[test]
    fn test_create_and_propagate() {
        let (_device, mut scene, _meshes, _mesh) = setup();
        let root = scene.root();
        let a = scene
            .create_node(root, LocalTransform::from_translation(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        let b = scene
            .create_node(a, LocalTransform::from_translation(Vec3::new(0.0, 1.0, 0.0)))
            .unwrap();
        let _token = scene.update(0.016);

        let world = scene.world_matrix(b).unwrap();
        assert_relative_eq!(world[(0, 3)], 1.0);
        assert_relative_eq!(world[(1, 3)], 1.0);
        assert_eq!(scene.parent(b), Some(a));
        assert_eq!(scene.children(root), &[a]);
        assert_eq!(scene.node_count(), 3);
    }

    #[test]
    fn test_rebuild_skips_when_clean() {
        let (device, mut scene, meshes, mesh) = setup();
        let node = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        scene.attach_mesh(node, mesh, &meshes).unwrap();

        let token = scene.update(0.0);
        assert!(scene.rebuild_tlas(token, &meshes).unwrap());
        let token = scene.update(0.0);
        assert!(!scene.rebuild_tlas(token, &meshes).unwrap());

        assert_eq!(device.stats().tlas_builds, 1);
        assert_eq!(scene.tlas().stats().skipped, 1);
        let instances = device.last_tlas_instances().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].custom_index(), 3);
        assert_eq!(instances[0].blas_address(), 0xB000);
    }

    #[test]
    fn test_stale_token_is_rejected() {
        let (_device, mut scene, meshes, _mesh) = setup();
        let node = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        let token = scene.update(0.0);
        scene.set_translation(node, Vec3::new(0.0, 0.0, 1.0)).unwrap();

        let err = scene.rebuild_tlas(token, &meshes).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::StaleAcceleration);
    }

    #[test]
    fn test_token_from_other_scene_is_rejected() {
        let (_device, mut first, meshes, _mesh) = setup();
        let (_device2, mut second, _meshes2, _mesh2) = setup();
        let token = second.update(0.0);
        let _ = first.update(0.0);
        assert!(matches!(
            first.rebuild_tlas(token, &meshes),
            Err(crate::error::EngineError::Scene(SceneError::ForeignToken))
        ));
    }

    #[test]
    fn test_reparent_rejects_cycles() {
        let (_device, mut scene, _meshes, _mesh) = setup();
        let a = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        let b = scene.create_node(a, LocalTransform::identity()).unwrap();
        let c = scene.create_node(b, LocalTransform::identity()).unwrap();

        assert_eq!(
            scene.reparent(a, c),
            Err(SceneError::CycleDetected { entity: a, parent: c })
        );
        assert_eq!(scene.reparent(a, a), Err(SceneError::CycleDetected { entity: a, parent: a }));
        assert_eq!(scene.reparent(scene.root(), a), Err(SceneError::RootIsFixed));

        scene.reparent(c, scene.root()).unwrap();
        assert_eq!(scene.parent(c), Some(scene.root()));
        assert!(scene.children(b).is_empty());
    }

    #[test]
    fn test_remove_node_drops_subtree() {
        let (device, mut scene, meshes, mesh) = setup();
        let a = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        let b = scene.create_node(a, LocalTransform::identity()).unwrap();
        let keep = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        scene.attach_mesh(b, mesh, &meshes).unwrap();
        scene.attach_mesh(keep, mesh, &meshes).unwrap();
        let token = scene.update(0.0);
        scene.rebuild_tlas(token, &meshes).unwrap();

        assert_eq!(scene.remove_node(a).unwrap(), 2);
        assert!(!scene.world().is_alive(b));
        assert!(scene.dirty_flags().contains(DirtyFlags::TLAS));
        assert_eq!(scene.remove_node(scene.root()), Err(SceneError::RootIsFixed));

        let token = scene.update(0.0);
        scene.rebuild_tlas(token, &meshes).unwrap();
        assert_eq!(device.last_tlas_instances().unwrap().len(), 1);
        assert_eq!(scene.node_count(), 2);
    }

    #[test]
    fn test_add_node_validates_membership() {
        let (_device, mut scene, meshes, mesh) = setup();
        let loose = scene.spawn();
        assert_eq!(scene.attach_mesh(loose, mesh, &meshes), Err(SceneError::NotInGraph(loose)));
        scene.add_node(scene.root(), loose).unwrap();
        assert_eq!(scene.add_node(scene.root(), loose), Err(SceneError::AlreadyInGraph(loose)));

        let removed = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        scene.remove_node(removed).unwrap();
        assert_eq!(
            scene.create_node(removed, LocalTransform::identity()),
            Err(SceneError::EntityNotFound(removed))
        );
    }

    #[test]
    fn test_missing_mesh_fails_rebuild() {
        let (_device, mut scene, mut meshes, mesh) = setup();
        let node = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        scene.attach_mesh(node, mesh, &meshes).unwrap();
        meshes.0.remove(&mesh);
        let token = scene.update(0.0);
        let err = scene.rebuild_tlas(token, &meshes).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidHandle);
        assert!(scene.dirty_flags().contains(DirtyFlags::TLAS));
    }

    #[test]
    fn test_attach_rejects_unloaded_meshes() {
        let (_device, mut scene, meshes, _mesh) = setup();
        let node = scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        assert_eq!(
            scene.attach_mesh(node, ResourceHandle::INVALID, &meshes),
            Err(SceneError::MeshNotLoaded(ResourceHandle::INVALID))
        );
        let stale = ResourceHandle::new(3, 1);
        assert_eq!(scene.attach_mesh(node, stale, &meshes), Err(SceneError::MeshNotLoaded(stale)));
        assert_eq!(scene.mesh_of(node), None);
    }

    #[test]
    fn test_insertion_marks_topology_and_tlas_dirty() {
        let (_device, mut scene, meshes, _mesh) = setup();
        let token = scene.update(0.0);
        scene.rebuild_tlas(token, &meshes).unwrap();
        assert!(scene.dirty_flags().is_empty());

        scene.create_node(scene.root(), LocalTransform::identity()).unwrap();
        assert_eq!(scene.dirty_flags(), DirtyFlags::SCENE_GRAPH | DirtyFlags::TLAS);

        let _ = scene.update(0.0);
        let loose = scene.spawn();
        let token = scene.update(0.0);
        scene.rebuild_tlas(token, &meshes).unwrap();
        scene.add_node(scene.root(), loose).unwrap();
        assert_eq!(scene.dirty_flags(), DirtyFlags::SCENE_GRAPH | DirtyFlags::TLAS);
    }

    #[test]
    fn test_root_level_nodes_ignore_root_transform() {
        let (_device, mut scene, _meshes, _mesh) = setup();
        let root = scene.root();
        scene.set_translation(root, Vec3::new(10.0, 0.0, 0.0)).unwrap();
        let child = scene
            .create_node(root, LocalTransform::from_translation(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        let grandchild = scene
            .create_node(child, LocalTransform::from_translation(Vec3::new(0.0, 2.0, 0.0)))
            .unwrap();
        let _ = scene.update(0.0);

        assert_relative_eq!(scene.world_matrix(root).unwrap()[(0, 3)], 10.0);
        assert_relative_eq!(scene.world_matrix(child).unwrap()[(0, 3)], 1.0);
        let grandchild_world = scene.world_matrix(grandchild).unwrap();
        assert_relative_eq!(grandchild_world[(0, 3)], 1.0);
        assert_relative_eq!(grandchild_world[(1, 3)], 2.0);
    }
}
