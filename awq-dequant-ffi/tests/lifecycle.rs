use std::ptr;

use awq_dequant::AwqStatus;
use awq_dequant_ffi::*;

fn desc(rows: usize, cols: usize, dtype: u32) -> AwqTensorDesc {
    AwqTensorDesc {
        rows,
        cols,
        dtype,
        device: AWQ_DEVICE_CPU,
        device_id: 0,
    }
}

struct Problem {
    y: AwqTensorDesc,
    qweight: AwqTensorDesc,
    qzeros: AwqTensorDesc,
    scales: AwqTensorDesc,
}

/// 4 x 16 f32 output in groups of 2.
fn problem() -> Problem {
    Problem {
        y: desc(4, 16, AWQ_DTYPE_F32),
        qweight: desc(4, 2, AWQ_DTYPE_U32),
        qzeros: desc(2, 2, AWQ_DTYPE_U32),
        scales: desc(2, 16, AWQ_DTYPE_F32),
    }
}

unsafe fn create(handle: AwqHandle, p: &Problem, group_size: i64) -> (AwqStatus, AwqDescriptor) {
    let mut id = 0;
    let status = awq_create_descriptor(
        handle,
        &mut id,
        &p.y,
        &p.qweight,
        &p.qzeros,
        &p.scales,
        group_size,
    );
    (status, id)
}

unsafe fn cpu_handle() -> AwqHandle {
    let mut handle = 0;
    assert_eq!(
        awq_create_handle(AWQ_DEVICE_CPU, 0, &mut handle),
        AwqStatus::Success
    );
    assert_ne!(handle, 0);
    handle
}

#[test]
fn test_full_lifecycle() {
    unsafe {
        let handle = cpu_handle();
        let p = problem();
        let (status, id) = create(handle, &p, 2);
        assert_eq!(status, AwqStatus::Success);

        let mut size = 0usize;
        assert_eq!(awq_get_workspace_size(id, &mut size), AwqStatus::Success);
        assert_eq!(size, 2 * 16);

        // Row r holds nibble r + 2 everywhere, zero-points are 1, scales 0.5.
        let qweight: Vec<u32> = (0..4u32).flat_map(|r| [(r + 2) * 0x11111111; 2]).collect();
        let qzeros = vec![0x11111111u32; 4];
        let scales = vec![0.5f32; 32];
        let mut y = vec![0f32; 64];
        let mut workspace = vec![0u8; size];
        let status = awq_dequantize(
            id,
            workspace.as_mut_ptr().cast(),
            workspace.len(),
            y.as_mut_ptr().cast(),
            qweight.as_ptr().cast(),
            qzeros.as_ptr().cast(),
            scales.as_ptr().cast(),
            0,
        );
        assert_eq!(status, AwqStatus::Success);
        for (r, row) in y.chunks(16).enumerate() {
            assert!(row.iter().all(|v| *v == (r as f32 + 1.) * 0.5));
        }

        assert_eq!(awq_destroy_descriptor(id), AwqStatus::Success);
        assert_eq!(awq_destroy_descriptor(id), AwqStatus::InvalidDescriptor);
        assert_eq!(
            awq_get_workspace_size(id, &mut size),
            AwqStatus::InvalidDescriptor
        );
        assert_eq!(awq_destroy_handle(handle), AwqStatus::Success);
    }
}

#[test]
fn test_creation_status_codes() {
    unsafe {
        let handle = cpu_handle();
        let mut p = problem();
        assert_eq!(create(handle, &p, 0).0, AwqStatus::InvalidGroupSize);
        assert_eq!(create(handle, &p, 3).0, AwqStatus::InvalidShape);
        assert_eq!(create(0, &p, 2).0, AwqStatus::InvalidDescriptor);

        p.scales.dtype = 9;
        assert_eq!(create(handle, &p, 2).0, AwqStatus::InvalidDtype);
        p.scales.dtype = AWQ_DTYPE_F32;
        p.y.cols = 15;
        assert_eq!(create(handle, &p, 2).0, AwqStatus::InvalidShape);

        let mut cuda = 0;
        assert_eq!(
            awq_create_handle(AWQ_DEVICE_CUDA, 0, &mut cuda),
            AwqStatus::Success
        );
        assert_eq!(create(cuda, &problem(), 2).0, AwqStatus::DeviceError);
        assert_eq!(awq_create_handle(7, 0, &mut cuda), AwqStatus::DeviceError);

        let p = problem();
        let status = awq_create_descriptor(
            handle,
            ptr::null_mut(),
            &p.y,
            &p.qweight,
            &p.qzeros,
            &p.scales,
            2,
        );
        assert_eq!(status, AwqStatus::NullPointer);
        assert_eq!(
            awq_create_handle(AWQ_DEVICE_CPU, 0, ptr::null_mut()),
            AwqStatus::NullPointer
        );
    }
}

#[test]
fn test_execute_status_codes() {
    unsafe {
        let handle = cpu_handle();
        let (_, id) = create(handle, &problem(), 2);
        let qweight = vec![0u32; 8];
        let qzeros = vec![0u32; 4];
        let scales = vec![1f32; 32];
        let mut y = vec![0f32; 64];
        let mut workspace = vec![0u8; 31];

        let status = awq_dequantize(
            id,
            workspace.as_mut_ptr().cast(),
            workspace.len(),
            y.as_mut_ptr().cast(),
            qweight.as_ptr().cast(),
            qzeros.as_ptr().cast(),
            scales.as_ptr().cast(),
            0,
        );
        assert_eq!(status, AwqStatus::InsufficientWorkspace);

        let status = awq_dequantize(
            id,
            workspace.as_mut_ptr().cast(),
            workspace.len(),
            ptr::null_mut(),
            qweight.as_ptr().cast(),
            qzeros.as_ptr().cast(),
            scales.as_ptr().cast(),
            0,
        );
        assert_eq!(status, AwqStatus::NullPointer);

        let status = awq_dequantize(
            0,
            workspace.as_mut_ptr().cast(),
            workspace.len(),
            y.as_mut_ptr().cast(),
            qweight.as_ptr().cast(),
            qzeros.as_ptr().cast(),
            scales.as_ptr().cast(),
            0,
        );
        assert_eq!(status, AwqStatus::InvalidDescriptor);
        assert_eq!(awq_destroy_descriptor(id), AwqStatus::Success);
    }
}

#[test]
fn test_stream_execution() {
    unsafe {
        let handle = cpu_handle();
        let (_, id) = create(handle, &problem(), 2);
        let mut stream = 0;
        assert_eq!(awq_create_stream(&mut stream), AwqStatus::Success);
        assert_ne!(stream, 0);

        let qweight = vec![0x99999999u32; 8];
        let qzeros = vec![0x33333333u32; 4];
        let scales = vec![0.25f32; 32];
        let mut outputs = vec![vec![0f32; 64]; 3];
        let mut workspaces = vec![vec![0u8; 32]; 3];
        for (y, workspace) in outputs.iter_mut().zip(workspaces.iter_mut()) {
            let status = awq_dequantize(
                id,
                workspace.as_mut_ptr().cast(),
                workspace.len(),
                y.as_mut_ptr().cast(),
                qweight.as_ptr().cast(),
                qzeros.as_ptr().cast(),
                scales.as_ptr().cast(),
                stream,
            );
            assert_eq!(status, AwqStatus::Success);
        }
        assert_eq!(awq_stream_synchronize(stream), AwqStatus::Success);
        for y in &outputs {
            assert!(y.iter().all(|v| *v == 1.5));
        }

        let mut short = vec![0u8; 4];
        let status = awq_dequantize(
            id,
            short.as_mut_ptr().cast(),
            short.len(),
            outputs[0].as_mut_ptr().cast(),
            qweight.as_ptr().cast(),
            qzeros.as_ptr().cast(),
            scales.as_ptr().cast(),
            stream,
        );
        assert_eq!(status, AwqStatus::InsufficientWorkspace);

        assert_eq!(awq_destroy_stream(stream), AwqStatus::Success);
        assert_eq!(awq_stream_synchronize(stream), AwqStatus::InvalidDescriptor);
        assert_eq!(awq_destroy_descriptor(id), AwqStatus::Success);
        assert_eq!(awq_destroy_handle(handle), AwqStatus::Success);
    }
}

#[test]
fn test_signed_packed_words() {
    unsafe {
        let handle = cpu_handle();
        let mut p = problem();
        p.qweight.dtype = AWQ_DTYPE_I32;
        p.qzeros.dtype = AWQ_DTYPE_I32;
        let (status, id) = create(handle, &p, 2);
        assert_eq!(status, AwqStatus::Success);

        // Nibbles 9 with the sign bit set, zero-points 3: (9 - 3) * 0.25 everywhere.
        let qweight = vec![0x99999999u32 as i32; 8];
        let qzeros = vec![0x33333333i32; 4];
        assert!(qweight[0] < 0);
        let scales = vec![0.25f32; 32];
        let mut y = vec![0f32; 64];
        let mut workspace = vec![0u8; 32];
        let status = awq_dequantize(
            id,
            workspace.as_mut_ptr().cast(),
            workspace.len(),
            y.as_mut_ptr().cast(),
            qweight.as_ptr().cast(),
            qzeros.as_ptr().cast(),
            scales.as_ptr().cast(),
            0,
        );
        assert_eq!(status, AwqStatus::Success);
        assert!(y.iter().all(|v| *v == 1.5));

        assert_eq!(awq_destroy_descriptor(id), AwqStatus::Success);
        assert_eq!(awq_destroy_handle(handle), AwqStatus::Success);
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_unaddressable_shapes_are_rejected() {
    unsafe {
        let handle = cpu_handle();
        let m = 1usize << 61;
        let p = Problem {
            y: desc(16, m, AWQ_DTYPE_F32),
            qweight: desc(16, m / 8, AWQ_DTYPE_U32),
            qzeros: desc(16, m / 8, AWQ_DTYPE_U32),
            scales: desc(16, m, AWQ_DTYPE_F32),
        };
        let (status, id) = create(handle, &p, 1);
        assert_eq!(status, AwqStatus::InvalidShape);
        assert_eq!(id, 0);
        assert_eq!(awq_destroy_handle(handle), AwqStatus::Success);
    }
}
