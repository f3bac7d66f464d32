//! End-to-end backend exercises against the simulated hardware: a full
//! frame with textured geometry, and texture eviction under a small heap.

use glam::{Mat4, Vec2, Vec3};
use kiln_common::{
    Camera, ClearFlags, Geometry, GeometryFlags, GeometryId, LockFlags, Material, MaterialId,
    Mesh, MeshHeader, MeshPrimitive, MorphTarget, Rgba, Texture,
};
use kiln_gx::{
    Device, DeviceConfig, GxHardware, MemoryBudget, PipelineKind, RasterDesc, RasterFormat,
    RasterType, SimGx,
};

fn quad_geometry(id: u32) -> Geometry {
    Geometry {
        id: GeometryId(id),
        flags: GeometryFlags::POSITIONS
            | GeometryFlags::NORMALS
            | GeometryFlags::PRELIT
            | GeometryFlags::TEXTURED,
        morph_targets: vec![MorphTarget {
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            normals: vec![Vec3::Z; 4],
        }],
        colors: vec![Rgba::WHITE; 4],
        tex_coords: vec![vec![Vec2::ZERO; 4]],
        mesh_header: MeshHeader {
            serial: 1,
            primitive: MeshPrimitive::TriList,
            meshes: vec![Mesh {
                indices: vec![0, 1, 2, 0, 2, 3],
                material: MaterialId(0),
            }],
        },
        locked_since_inst: LockFlags::empty(),
    }
}

#[test]
fn test_full_frame() {
    let mut dev = Device::open(SimGx::new(), DeviceConfig::default());

    let fb = dev
        .raster_create(RasterDesc::new(
            400,
            240,
            32,
            RasterFormat::C8888,
            RasterType::Camera,
        ))
        .unwrap();
    let zb = dev
        .raster_create(RasterDesc::new(
            400,
            240,
            32,
            RasterFormat::DEFAULT,
            RasterType::ZBuffer,
        ))
        .unwrap();
    let cam = Camera::new(fb, Some(zb));

    let tex_raster = dev
        .raster_create(RasterDesc::new(
            64,
            64,
            32,
            RasterFormat::C8888,
            RasterType::Texture,
        ))
        .unwrap();
    let mut tex = Texture::new("panel");
    tex.raster = tex_raster;
    let mut material = Material::default();
    material.texture = Some(tex);
    let materials = vec![material];

    let mut geo = quad_geometry(1);

    dev.begin_update(&cam);
    dev.clear_camera(&cam, Rgba::BLACK, ClearFlags::IMAGE | ClearFlags::Z);
    dev.render_atomic(
        &mut geo,
        &Mat4::IDENTITY,
        &kiln_common::WorldLights::none(),
        &materials,
    );
    dev.end_update(&cam);
    dev.show_raster(fb);

    assert_eq!(dev.hardware().frames_begun, 1);
    assert_eq!(dev.hardware().frames_ended, 1);
    assert_eq!(dev.hardware().presents, 1);
    assert_eq!(dev.hardware().draws.len(), 1);
    assert_eq!(dev.hardware().draws[0].count, 6);

    // drawing the same clean geometry with the same material again must
    // not reinstance and must not emit any further state change
    dev.begin_update(&cam);
    let state_commands = dev.hardware().state_command_count();
    let geo2_buffer = dev.instance_header(geo.id).unwrap().vertex_buffer;
    dev.render_atomic(
        &mut geo,
        &Mat4::IDENTITY,
        &kiln_common::WorldLights::none(),
        &materials,
    );
    assert_eq!(dev.instance_header(geo.id).unwrap().vertex_buffer, geo2_buffer);
    assert_eq!(dev.hardware().state_command_count(), state_commands);
    dev.end_update(&cam);
}

#[test]
fn test_eviction_under_memory_pressure() {
    // heap just big enough for a handful of mip chains plus the quad's
    // instance buffers
    let budget = MemoryBudget {
        high_water: 0,
        low_water: 0,
    };
    let config = DeviceConfig {
        force_compression: false,
        budget,
        ..DeviceConfig::default()
    };
    let mut dev = Device::open(SimGx::with_memory(300 << 10, 0), config);

    let format = RasterFormat::C8888 | RasterFormat::MIPMAP | RasterFormat::AUTOMIPMAP;
    let mut rasters = Vec::new();
    for _ in 0..4 {
        // each chain is ~87k; four of them plus working buffers exceed the
        // heap, so later allocations must shrink earlier textures
        rasters.push(
            dev.raster_create(RasterDesc::new(128, 128, 32, format, RasterType::Texture))
                .unwrap(),
        );
    }

    // every raster is still allocated
    for &id in &rasters {
        assert!(dev.raster(id).tex.is_some());
    }

    // at least one earlier texture gave up a level
    let shrunk = rasters
        .iter()
        .any(|&id| dev.raster(id).tex.as_ref().unwrap().max_level < 4);
    assert!(shrunk);

    // invariant: pool entries can always shrink further; run the pool dry
    // and watch sizes strictly decrease
    loop {
        let before: Vec<u32> = rasters
            .iter()
            .map(|&id| dev.raster(id).tex.as_ref().unwrap().size)
            .collect();
        if dev.shrink_texture_memory() == 0 {
            break;
        }
        let after: Vec<u32> = rasters
            .iter()
            .map(|&id| dev.raster(id).tex.as_ref().unwrap().size)
            .collect();
        assert!(after.iter().zip(&before).all(|(a, b)| a <= b));
        assert!(after.iter().zip(&before).any(|(a, b)| a < b));
    }

    // everything shrunk to the 8x8 floor and stays resident
    for &id in &rasters {
        let tex = dev.raster(id).tex.as_ref().unwrap();
        assert_eq!(tex.max_level, 0);
        assert_eq!((tex.width, tex.height), (8, 8));
    }
}

#[test]
fn test_partial_reinstance_after_frame() {
    let mut dev = Device::open(SimGx::new(), DeviceConfig::default());
    let mut geo = quad_geometry(1);

    dev.instance_geometry(&mut geo, PipelineKind::Default);
    let header = dev.instance_header(geo.id).unwrap();
    let buffer = header.vertex_buffer.unwrap();
    let before = dev.hardware().mem(buffer).to_vec();

    // simulate the engine mutating positions between frames
    geo.morph_targets[0].vertices[0] = Vec3::new(9.0, 9.0, 9.0);
    geo.locked_since_inst = LockFlags::VERTICES;
    dev.instance_geometry(&mut geo, PipelineKind::Default);

    assert_eq!(dev.instance_header(geo.id).unwrap().vertex_buffer, Some(buffer));
    let after = dev.hardware().mem(buffer).to_vec();
    assert_ne!(before, after);
    // only the first vertex's position bytes changed
    let stride = dev.instance_header(geo.id).unwrap().stride;
    assert_eq!(&before[stride..], &after[stride..]);
}
