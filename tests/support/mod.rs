pub mod mock_imageserver;
