//! CoreAudio device path
//!
//! A HAL output unit on the default device pulls the render callback;
//! with input enabled a second HAL unit captures the default input device
//! into a lock-free ring that the render path drains.

use super::{render_entry, DriverConfig, RenderShared};
use crate::bank::MAX_NUM_FRAMES;
use crate::spsc::FixedSpscQueue;
use crate::thread_policy::mach_absolute_time_to_seconds;
use crate::workgroup::{AudioWorkgroup, SomeAudioWorkgroup};
use coreaudio::audio_unit::audio_format::LinearPcmFlags;
use coreaudio::audio_unit::macos_helpers::{
    get_default_device_id, get_device_name, set_device_sample_rate,
};
use coreaudio::audio_unit::render_callback::{self, data};
use coreaudio::audio_unit::{AudioUnit, Element, IOType, SampleFormat, Scope, StreamFormat};
use coreaudio::sys::{
    kAudioDevicePropertyBufferFrameSize, kAudioObjectPropertyElementMaster,
    kAudioObjectPropertyScopeGlobal, AudioObjectGetPropertyData, AudioObjectPropertyAddress,
    AudioObjectSetPropertyData,
};
use std::ptr;
use std::sync::Arc;

/// Sample rate requested from the device
const SAMPLE_RATE: f64 = 48000.0;

/// Frames buffered between the input and output units
const INPUT_RING_FRAMES: u32 = 16384;

// Introduced with the public workgroup API; not in the generated sys
// constants yet.
#[allow(non_upper_case_globals)]
const kAudioOutputUnitProperty_OSWorkgroup: u32 = 2015;

/// Set the device I/O buffer size (CoreAudio property)
fn set_device_buffer_frame_size(device_id: u32, num_frames: u32) -> Result<(), String> {
    let address = AudioObjectPropertyAddress {
        mSelector: kAudioDevicePropertyBufferFrameSize,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMaster,
    };

    let status = unsafe {
        AudioObjectSetPropertyData(
            device_id,
            &address,
            0,
            ptr::null(),
            std::mem::size_of::<u32>() as u32,
            &num_frames as *const u32 as *const _,
        )
    };

    if status != 0 {
        return Err(format!("Failed to set buffer size: OSStatus {}", status));
    }
    Ok(())
}

/// Get the device I/O buffer size (CoreAudio property)
fn get_device_buffer_frame_size(device_id: u32) -> Option<u32> {
    let address = AudioObjectPropertyAddress {
        mSelector: kAudioDevicePropertyBufferFrameSize,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMaster,
    };

    let mut num_frames: u32 = 0;
    let mut size = std::mem::size_of::<u32>() as u32;

    let status = unsafe {
        AudioObjectGetPropertyData(
            device_id,
            &address,
            0,
            ptr::null(),
            &mut size,
            &mut num_frames as *mut u32 as *mut _,
        )
    };

    (status == 0).then_some(num_frames)
}

/// Captures the default input device into a ring the render path drains
struct InputCapture {
    // Held for its Drop; the unit runs until then
    _audio_unit: AudioUnit,
    ring: Arc<FixedSpscQueue<[f32; 2]>>,
}

impl InputCapture {
    fn new() -> Result<Self, String> {
        let device_id = get_default_device_id(true).ok_or("No default input device")?;
        let device_name =
            get_device_name(device_id).unwrap_or_else(|_| format!("Device {}", device_id));
        println!("[Driver] Capturing input from {} (ID: {})", device_name, device_id);

        if let Err(e) = set_device_sample_rate(device_id, SAMPLE_RATE) {
            println!("[Driver] Warning: Could not set input sample rate: {:?}", e);
        }

        let mut audio_unit = AudioUnit::new(IOType::HalOutput)
            .map_err(|e| format!("Failed to create input unit: {:?}", e))?;

        audio_unit
            .set_property(
                coreaudio::sys::kAudioOutputUnitProperty_EnableIO,
                Scope::Input,
                Element::Input,
                Some(&1u32),
            )
            .map_err(|e| format!("Failed to enable input: {:?}", e))?;

        audio_unit
            .set_property(
                coreaudio::sys::kAudioOutputUnitProperty_EnableIO,
                Scope::Output,
                Element::Output,
                Some(&0u32),
            )
            .map_err(|e| format!("Failed to disable output: {:?}", e))?;

        audio_unit
            .set_property(
                coreaudio::sys::kAudioOutputUnitProperty_CurrentDevice,
                Scope::Global,
                Element::Output,
                Some(&device_id),
            )
            .map_err(|e| format!("Failed to set input device: {:?}", e))?;

        let stream_format = StreamFormat {
            sample_rate: SAMPLE_RATE,
            sample_format: SampleFormat::F32,
            flags: LinearPcmFlags::IS_FLOAT | LinearPcmFlags::IS_PACKED,
            channels: 2,
        };
        audio_unit
            .set_property(
                coreaudio::sys::kAudioUnitProperty_StreamFormat,
                Scope::Output,
                Element::Input,
                Some(&stream_format.to_asbd()),
            )
            .map_err(|e| format!("Failed to set input stream format: {:?}", e))?;

        let ring = Arc::new(FixedSpscQueue::new(INPUT_RING_FRAMES));
        let producer_ring = Arc::clone(&ring);

        type Args = render_callback::Args<data::Interleaved<f32>>;
        audio_unit
            .set_input_callback(move |args: Args| {
                let Args { data, num_frames, .. } = args;
                let buffer = data.buffer;
                if buffer.len() < num_frames * 2 {
                    return Ok(());
                }

                for frame in 0..num_frames {
                    // A full ring drops the newest frames; the render side
                    // will simply reuse silence
                    producer_ring.try_push_back([buffer[frame * 2], buffer[frame * 2 + 1]]);
                }
                Ok(())
            })
            .map_err(|e| format!("Failed to set input callback: {:?}", e))?;

        audio_unit
            .initialize()
            .map_err(|e| format!("Failed to initialize input unit: {:?}", e))?;
        audio_unit
            .start()
            .map_err(|e| format!("Failed to start input unit: {:?}", e))?;

        Ok(Self {
            _audio_unit: audio_unit,
            ring,
        })
    }
}

pub(crate) struct CoreAudioBackend {
    audio_unit: AudioUnit,
    // Held for its Drop; stops capturing when the backend goes away
    _input: Option<InputCapture>,
    device_id: u32,
    buffer_size: usize,
    workgroup: Option<AudioWorkgroup>,
}

impl CoreAudioBackend {
    pub(crate) fn new(shared: Arc<RenderShared>, config: &DriverConfig) -> Result<Self, String> {
        let device_id = get_default_device_id(false).ok_or("No default output device")?;
        let device_name =
            get_device_name(device_id).unwrap_or_else(|_| format!("Device {}", device_id));

        if let Err(e) = set_device_sample_rate(device_id, SAMPLE_RATE) {
            println!("[Driver] Warning: Could not set sample rate: {:?}", e);
        }

        if let Err(message) =
            set_device_buffer_frame_size(device_id, config.preferred_buffer_size as u32)
        {
            println!("[Driver] Warning: {}", message);
        }
        let buffer_size = get_device_buffer_frame_size(device_id)
            .map(|n| n as usize)
            .unwrap_or(config.preferred_buffer_size)
            .min(MAX_NUM_FRAMES);

        println!(
            "[Driver] Output on {} (ID: {}, {} frames)",
            device_name, device_id, buffer_size
        );

        let input = if config.is_input_enabled {
            match InputCapture::new() {
                Ok(input) => Some(input),
                Err(message) => return Err(message),
            }
        } else {
            None
        };

        let mut audio_unit = AudioUnit::new(IOType::HalOutput)
            .map_err(|e| format!("Failed to create audio unit: {:?}", e))?;

        audio_unit
            .set_property(
                coreaudio::sys::kAudioOutputUnitProperty_CurrentDevice,
                Scope::Global,
                Element::Output,
                Some(&device_id),
            )
            .map_err(|e| format!("Failed to set device: {:?}", e))?;

        let stream_format = StreamFormat {
            sample_rate: SAMPLE_RATE,
            sample_format: SampleFormat::F32,
            flags: LinearPcmFlags::IS_FLOAT
                | LinearPcmFlags::IS_PACKED
                | LinearPcmFlags::IS_NON_INTERLEAVED,
            channels: 2,
        };
        audio_unit
            .set_property(
                coreaudio::sys::kAudioUnitProperty_StreamFormat,
                Scope::Input,
                Element::Output,
                Some(&stream_format.to_asbd()),
            )
            .map_err(|e| format!("Failed to set stream format: {:?}", e))?;

        let input_ring = input.as_ref().map(|input| Arc::clone(&input.ring));

        type Args = render_callback::Args<data::NonInterleaved<f32>>;
        audio_unit
            .set_render_callback(move |args: Args| {
                let Args {
                    mut data,
                    num_frames,
                    time_stamp,
                    bus_number,
                    ..
                } = args;

                if num_frames > MAX_NUM_FRAMES {
                    return Ok(());
                }

                let mut channels = data.channels_mut();
                let (Some(left), Some(right)) = (channels.next(), channels.next()) else {
                    return Ok(());
                };

                left[..num_frames].fill(0.0);
                right[..num_frames].fill(0.0);
                if let Some(ring) = &input_ring {
                    for frame in 0..num_frames {
                        let Some([l, r]) = ring.pop_value() else { break };
                        left[frame] = l;
                        right[frame] = r;
                    }
                }

                render_entry(
                    &shared,
                    mach_absolute_time_to_seconds(time_stamp.mHostTime),
                    bus_number,
                    num_frames,
                    &mut left[..num_frames],
                    &mut right[..num_frames],
                );
                Ok(())
            })
            .map_err(|e| format!("Failed to set render callback: {:?}", e))?;

        audio_unit
            .initialize()
            .map_err(|e| format!("Failed to initialize audio unit: {:?}", e))?;
        audio_unit
            .start()
            .map_err(|e| format!("Failed to start audio unit: {:?}", e))?;

        let workgroup = audio_unit
            .get_property::<*mut std::os::raw::c_void>(
                kAudioOutputUnitProperty_OSWorkgroup,
                Scope::Global,
                Element::Output,
            )
            .ok()
            .filter(|pointer| !pointer.is_null())
            .map(AudioWorkgroup::new);

        Ok(Self {
            audio_unit,
            _input: input,
            device_id,
            buffer_size,
            workgroup,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        SAMPLE_RATE
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn request_buffer_size(&mut self, num_frames: usize) -> Result<usize, String> {
        set_device_buffer_frame_size(self.device_id, num_frames as u32)?;
        self.buffer_size = get_device_buffer_frame_size(self.device_id)
            .map(|n| n as usize)
            .unwrap_or(num_frames)
            .min(MAX_NUM_FRAMES);
        Ok(self.buffer_size)
    }

    pub fn workgroup(&self) -> SomeAudioWorkgroup {
        match self.workgroup {
            Some(workgroup) => SomeAudioWorkgroup::Workgroup(workgroup),
            None => SomeAudioWorkgroup::discover(),
        }
    }
}

impl Drop for CoreAudioBackend {
    fn drop(&mut self) {
        let _ = self.audio_unit.stop();
    }
}
