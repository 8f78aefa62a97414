//! End-to-end scene synchronization against the recording device

use std::sync::Arc;

use rt_scene::assets::Vertex;
use rt_scene::core::config::PoolConfig;
use rt_scene::foundation::math::to_row_major_3x4;
use rt_scene::prelude::*;
use rt_scene::scene::DirtyFlags;

struct Fixture {
    device: Arc<RecordingDevice>,
    resources: ResourceManager,
    scene: Scene,
    frames: FrameDriver,
}

fn fixture(config: EngineConfig) -> Fixture {
    fixture_on(Arc::new(RecordingDevice::new()), config)
}

fn fixture_on(device: Arc<RecordingDevice>, config: EngineConfig) -> Fixture {
    let context = RenderContext::new(device.clone(), config).unwrap();
    Fixture {
        resources: ResourceManager::new(&context).unwrap(),
        scene: Scene::new(&context),
        frames: FrameDriver::new(&context),
        device,
    }
}

impl Fixture {
    fn frame(&mut self) -> FrameInputs {
        self.frames
            .prepare_frame(&mut self.scene, &mut self.resources, 1.0 / 60.0)
            .unwrap()
    }

    fn instanced_node(&mut self, parent: Entity, mesh: ResourceHandle, at: Vec3) -> Entity {
        let node = self
            .scene
            .create_node(parent, LocalTransform::from_translation(at))
            .unwrap();
        self.scene.attach_mesh(node, mesh, &self.resources).unwrap();
        node
    }
}

#[test]
fn instances_carry_world_transforms_and_mesh_slots() {
    let mut f = fixture(EngineConfig::default());
    let cube = f.resources.load_mesh("cube", &MeshData::cube()).unwrap();
    let tri = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();

    let root = f.scene.root();
    let a = f.instanced_node(root, cube, Vec3::new(1.0, 0.0, 0.0));
    let b = f.instanced_node(a, tri, Vec3::new(0.0, 2.0, 0.0));
    let c = f.instanced_node(b, cube, Vec3::new(0.0, 0.0, 3.0));

    let inputs = f.frame();
    assert_eq!(inputs.instance_count, 3);
    assert_eq!(Some(inputs.tlas_address), f.scene.tlas_address());

    let instances = f.device.last_tlas_instances().unwrap();
    for node in [a, b, c] {
        let expected = to_row_major_3x4(f.scene.world_matrix(node).unwrap());
        let mesh = f.scene.mesh_of(node).unwrap();
        let instance = instances
            .iter()
            .find(|i| i.transform == expected)
            .expect("instance for every node with a mesh");
        assert_eq!(instance.custom_index(), mesh.index());
        assert_eq!(instance.blas_address(), f.resources.mesh(mesh).unwrap().blas_address());
    }

    let c_world = f.scene.world_matrix(c).unwrap();
    assert_eq!((c_world[(0, 3)], c_world[(1, 3)], c_world[(2, 3)]), (1.0, 2.0, 3.0));
}

#[test]
fn detaching_a_mesh_shrinks_the_tlas() {
    let mut f = fixture(EngineConfig::default());
    let cube = f.resources.load_mesh("cube", &MeshData::cube()).unwrap();
    let root = f.scene.root();
    let nodes: Vec<_> = (0..3)
        .map(|i| f.instanced_node(root, cube, Vec3::new(i as f32, 0.0, 0.0)))
        .collect();

    assert_eq!(f.frame().instance_count, 3);
    assert_eq!(f.scene.detach_mesh(nodes[1]).unwrap(), Some(cube));
    assert!(f.scene.dirty_flags().contains(DirtyFlags::TLAS));

    let inputs = f.frame();
    assert!(inputs.tlas_rebuilt);
    assert_eq!(inputs.instance_count, 2);
    assert_eq!(f.device.last_tlas_instances().unwrap().len(), 2);

    let stats = f.device.stats();
    assert_eq!(stats.tlas_builds, 2);
    // One BLAS plus the current TLAS; the first TLAS is gone.
    assert_eq!(stats.live_acceleration_structures(), 2);
}

#[test]
fn clean_frames_do_no_device_work() {
    let mut f = fixture(EngineConfig::default());
    let tri = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();
    let root = f.scene.root();
    f.instanced_node(root, tri, Vec3::zeros());

    let first = f.frame();
    let before = f.device.stats();
    for _ in 0..5 {
        let inputs = f.frame();
        assert!(!inputs.tlas_rebuilt);
        assert_eq!(inputs.tlas_address, first.tlas_address);
    }
    let after = f.device.stats();
    assert_eq!(after.submissions, before.submissions);
    assert_eq!(after.wait_idle_calls, before.wait_idle_calls);
    assert_eq!(f.scene.tlas().stats().skipped, 5);
}

#[test]
fn moving_an_ancestor_rebuilds_with_new_descendant_transforms() {
    let mut f = fixture(EngineConfig::default());
    let tri = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();
    let root = f.scene.root();
    let parent = f.scene.create_node(root, LocalTransform::identity()).unwrap();
    let child = f.instanced_node(parent, tri, Vec3::new(0.0, 1.0, 0.0));
    f.frame();

    f.scene.set_translation(parent, Vec3::new(5.0, 0.0, 0.0)).unwrap();
    assert!(f.frame().tlas_rebuilt);

    let instance = f.device.last_tlas_instances().unwrap()[0];
    assert_eq!(instance.transform[3], 5.0);
    assert_eq!(instance.transform[7], 1.0);
    assert!(!f.scene.local_transform(child).unwrap().is_dirty());
}

#[test]
fn refit_policy_updates_in_place_until_the_count_changes() {
    let mut f = fixture(EngineConfig::default().with_tlas_policy(TlasBuildPolicy::Refit));
    let cube = f.resources.load_mesh("cube", &MeshData::cube()).unwrap();
    let root = f.scene.root();
    let node = f.instanced_node(root, cube, Vec3::zeros());
    let first = f.frame();

    f.scene.set_translation(node, Vec3::new(0.0, 0.0, -2.0)).unwrap();
    let moved = f.frame();
    assert!(moved.tlas_rebuilt);
    assert_eq!(moved.tlas_address, first.tlas_address);
    assert_eq!(f.device.stats().tlas_updates, 1);
    assert_eq!(f.device.last_tlas_instances().unwrap()[0].transform[11], -2.0);

    f.instanced_node(root, cube, Vec3::new(3.0, 0.0, 0.0));
    let grown = f.frame();
    assert_eq!(grown.instance_count, 2);
    assert_eq!(f.device.stats().tlas_builds, 2);
    assert_eq!(f.scene.tlas().stats().refits, 1);
}

#[test]
fn removing_a_subtree_drops_its_instances() {
    let mut f = fixture(EngineConfig::default());
    let tri = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();
    let root = f.scene.root();
    let group = f.scene.create_node(root, LocalTransform::identity()).unwrap();
    for i in 0..4 {
        f.instanced_node(group, tri, Vec3::new(i as f32, 0.0, 0.0));
    }
    f.instanced_node(root, tri, Vec3::zeros());
    assert_eq!(f.frame().instance_count, 5);

    assert_eq!(f.scene.remove_node(group).unwrap(), 5);
    assert_eq!(f.frame().instance_count, 1);
    assert_eq!(f.scene.node_count(), 2);
}

#[test]
fn evicted_mesh_is_reported_on_rebuild() {
    let mut f = fixture(EngineConfig::default());
    let tri = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();
    let root = f.scene.root();
    let node = f.instanced_node(root, tri, Vec3::zeros());
    assert!(f.frame().tlas_rebuilt);
    assert_eq!(f.device.stats().live_acceleration_structures(), 2);

    // No scene change between the eviction and the next frame.
    f.resources.evict_mesh(tri).unwrap();
    let err = f
        .frames
        .prepare_frame(&mut f.scene, &mut f.resources, 0.0)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidHandle);
    assert_eq!(f.scene.tlas_address(), None);
    assert_eq!(f.device.stats().live_acceleration_structures(), 0);

    let reloaded = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();
    assert_ne!(reloaded, tri);
    assert!(f.scene.attach_mesh(f.scene.root(), tri, &f.resources).is_err());

    f.scene.detach_mesh(node).unwrap();
    let inputs = f.frame();
    assert!(inputs.tlas_rebuilt);
    assert_eq!(inputs.instance_count, 0);
}

#[test]
fn frames_after_an_unrelated_eviction_rebuild_once() {
    let mut f = fixture(EngineConfig::default());
    let tri = f.resources.load_mesh("tri", &MeshData::triangle()).unwrap();
    let unused = f.resources.load_mesh("cube", &MeshData::cube()).unwrap();
    let root = f.scene.root();
    f.instanced_node(root, tri, Vec3::zeros());
    f.frame();

    f.resources.evict_mesh(unused).unwrap();
    let inputs = f.frame();
    assert!(inputs.tlas_rebuilt);
    assert_eq!(inputs.instance_count, 1);
    assert!(!f.frame().tlas_rebuilt);
}

fn strip_mesh(vertex_count: u32) -> MeshData {
    let vertices = (0..vertex_count)
        .map(|i| Vertex::new([i as f32, (i % 2) as f32, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]))
        .collect();
    let indices = (0..vertex_count - 2).flat_map(|i| [i, i + 1, i + 2]).collect();
    MeshData::single(vertices, indices)
}

#[test]
fn out_of_memory_is_reported_without_leaks() {
    let device = Arc::new(RecordingDevice::new().with_memory_budget(8 * 1024));
    let mut f = fixture_on(device, EngineConfig::default());
    let buffers_before = f.device.stats().live_buffers();

    let err = f.resources.load_mesh("big", &strip_mesh(400)).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    assert_eq!(f.device.stats().live_buffers(), buffers_before);
    assert!(f.resources.meshes().is_empty());
    assert!(f.resources.mesh_handle("big").is_none());

    let small = f.resources.load_mesh("small", &MeshData::triangle()).unwrap();
    assert_eq!(small.index(), 0);
}

#[test]
fn mesh_pool_capacity_is_fixed() {
    let config = EngineConfig::default().with_pools(PoolConfig {
        mesh_capacity: 2,
        ..PoolConfig::default()
    });
    let mut f = fixture(config);
    f.resources.load_mesh("a", &MeshData::triangle()).unwrap();
    f.resources.load_mesh("b", &MeshData::cube()).unwrap();
    assert_eq!(
        f.resources.load_mesh("c", &MeshData::triangle()).unwrap_err().category(),
        ErrorCategory::ResourceExhaustion
    );
    // Loading a live key still succeeds when the pool is full.
    assert!(f.resources.load_mesh("a", &MeshData::triangle()).is_ok());
}

#[test]
fn teardown_releases_every_device_object() {
    let device = Arc::new(RecordingDevice::new());
    {
        let mut f = fixture_on(device.clone(), EngineConfig::default());
        let cube = f.resources.load_mesh("cube", &MeshData::cube()).unwrap();
        let root = f.scene.root();
        f.instanced_node(root, cube, Vec3::zeros());
        f.frame();
    }
    let stats = device.stats();
    assert_eq!(stats.live_buffers(), 0);
    assert_eq!(stats.live_acceleration_structures(), 0);
    assert_eq!(stats.images_created, stats.images_destroyed);
}
